use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ModelBase {
    /// The name of the model
    pub name: String,

    /// The license of the base model
    pub license: String,

    /// The id of the base model repository
    pub repo_id: String,

    /// The revision of the base model repository
    pub repo_revision: String,

    /// Where the LoRA adapter merged into the base model was loaded from
    pub adapter: String,
}
