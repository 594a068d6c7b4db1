use axum::response::Html;

pub const TITLE: &str = "Indian Medical Symptom Normalizer";
pub const INPUT_LABEL: &str = "Enter symptom (Indian language)";
pub const OUTPUT_LABEL: &str = "Normalized English medical term";

/// Renders the single page form, `term` is empty until something was submitted.
/// Browsers drop one newline right after `<textarea>`, so each value is preceded
/// by one to keep its own leading newline.
pub fn render_page(symptom: &str, term: &str) -> Html<String> {
    Html(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{TITLE}</title>
<style>
body {{ font-family: sans-serif; max-width: 48rem; margin: 2rem auto; padding: 0 1rem; }}
label {{ display: block; margin: 1rem 0 0.25rem; font-weight: bold; }}
textarea {{ width: 100%; min-height: 4rem; font-size: 1rem; }}
button {{ margin-top: 1rem; padding: 0.5rem 1.5rem; font-size: 1rem; }}
</style>
</head>
<body>
<h1>{TITLE}</h1>
<form method="post" action="/">
<label for="symptom">{INPUT_LABEL}</label>
<textarea id="symptom" name="symptom">
{symptom}</textarea>
<button type="submit">Submit</button>
</form>
<label for="term">{OUTPUT_LABEL}</label>
<textarea id="term" readonly>
{term}</textarea>
</body>
</html>
"#,
        symptom = escape_html(symptom),
        term = escape_html(term),
    ))
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
