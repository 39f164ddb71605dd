use serde_json::Value;

const STYLE: &str = "body{font-family:Inter,Helvetica,Arial,sans-serif;font-size:11pt;color:#111;margin:0}\
h1{font-size:20pt;margin:0 0 4pt}h2{font-size:12pt;text-transform:uppercase;border-bottom:1px solid #999;margin:14pt 0 6pt}\
.headline{color:#444}.contact{color:#555;font-size:9.5pt}.item{margin-bottom:8pt}\
.item-head{display:flex;justify-content:space-between;font-weight:600}.sub{color:#444}ul{margin:2pt 0 0 14pt;padding:0}";

/// Renders snapshot content into a printable HTML document.
///
/// Expected shape:
/// `{ basics: {name, headline, email, phone, location, summary}, sections: [{title, items: [{title, subtitle, date_range, description, bullets: []}]}] }`
/// Missing fields are skipped; every value is HTML-escaped.
pub fn render_resume_html(content: &Value) -> String {
    let basics = content.get("basics");
    let field = |name: &str| -> Option<&str> {
        basics
            .and_then(|b| b.get(name))
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
    };

    let name = field("name").unwrap_or("Resume");
    let mut html = String::new();
    html.push_str("<!DOCTYPE html><html><head><meta charset=\"utf-8\">");
    html.push_str(&format!("<title>{}</title>", escape(name)));
    html.push_str(&format!("<style>{STYLE}</style></head><body>"));

    html.push_str(&format!("<header><h1>{}</h1>", escape(name)));
    if let Some(headline) = field("headline") {
        html.push_str(&format!("<div class=\"headline\">{}</div>", escape(headline)));
    }
    let contact: Vec<String> = ["email", "phone", "location"]
        .iter()
        .filter_map(|k| field(*k))
        .map(escape)
        .collect();
    if !contact.is_empty() {
        html.push_str(&format!(
            "<div class=\"contact\">{}</div>",
            contact.join(" &middot; ")
        ));
    }
    html.push_str("</header>");

    if let Some(summary) = field("summary") {
        html.push_str(&format!(
            "<section><h2>Summary</h2><p>{}</p></section>",
            escape(summary)
        ));
    }

    let sections = content
        .get("sections")
        .and_then(|s| s.as_array())
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    for section in sections {
        render_section(&mut html, section);
    }

    html.push_str("</body></html>");
    html
}

fn render_section(html: &mut String, section: &Value) {
    let items = section
        .get("items")
        .and_then(|i| i.as_array())
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    if items.is_empty() {
        return;
    }

    let title = str_field(section, "title").unwrap_or("Section");
    html.push_str(&format!("<section><h2>{}</h2>", escape(title)));
    for item in items {
        html.push_str("<div class=\"item\"><div class=\"item-head\">");
        html.push_str(&format!(
            "<span>{}</span>",
            escape(str_field(item, "title").unwrap_or_default())
        ));
        if let Some(dates) = str_field(item, "date_range") {
            html.push_str(&format!("<span>{}</span>", escape(dates)));
        }
        html.push_str("</div>");
        if let Some(subtitle) = str_field(item, "subtitle") {
            html.push_str(&format!("<div class=\"sub\">{}</div>", escape(subtitle)));
        }
        if let Some(description) = str_field(item, "description") {
            html.push_str(&format!("<p>{}</p>", escape(description)));
        }
        let bullets: Vec<&str> = item
            .get("bullets")
            .and_then(|b| b.as_array())
            .map(|b| b.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        if !bullets.is_empty() {
            html.push_str("<ul>");
            for bullet in bullets {
                html.push_str(&format!("<li>{}</li>", escape(bullet)));
            }
            html.push_str("</ul>");
        }
        html.push_str("</div>");
    }
    html.push_str("</section>");
}

fn str_field<'a>(value: &'a Value, name: &str) -> Option<&'a str> {
    value
        .get(name)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_renders_basics_and_sections() {
        let content = json!({
            "basics": {"name": "Ada Lovelace", "headline": "Analyst", "email": "ada@example.com"},
            "sections": [{
                "title": "Experience",
                "items": [{
                    "title": "Analytical Engine",
                    "subtitle": "Babbage & Co",
                    "date_range": "1842 – 1843",
                    "bullets": ["Wrote the first published algorithm"]
                }]
            }]
        });
        let html = render_resume_html(&content);
        assert!(html.contains("<h1>Ada Lovelace</h1>"));
        assert!(html.contains("<h2>Experience</h2>"));
        assert!(html.contains("Babbage &amp; Co"));
        assert!(html.contains("<li>Wrote the first published algorithm</li>"));
        assert!(html.contains("ada@example.com"));
    }

    #[test]
    fn test_escapes_markup_in_content() {
        let content = json!({"basics": {"name": "<script>alert('x')</script>"}});
        let html = render_resume_html(&content);
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;alert(&#39;x&#39;)&lt;/script&gt;"));
    }

    #[test]
    fn test_empty_content_still_renders_document() {
        let html = render_resume_html(&json!({}));
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<h1>Resume</h1>"));
        assert!(html.ends_with("</body></html>"));
    }

    #[test]
    fn test_sections_without_items_are_skipped() {
        let content = json!({"sections": [{"title": "Awards", "items": []}]});
        assert!(!render_resume_html(&content).contains("Awards"));
    }
}
