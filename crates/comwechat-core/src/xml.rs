//! Field extraction from the XML fragments the chat client embeds in events.
//!
//! The fragments are not always well-formed, so fields are pulled out with
//! non-greedy patterns instead of a parser.

use regex::Regex;

/// Value of the first `name="..."` attribute.
pub fn attr(xml: &str, name: &str) -> Option<String> {
    let re = Regex::new(&format!(r#"\b{}="(.*?)""#, regex::escape(name))).ok()?;
    re.captures(xml).map(|caps| caps[1].to_string())
}

/// Text of the first `<name>...</name>` element, with a CDATA wrapper removed.
pub fn tag(xml: &str, name: &str) -> Option<String> {
    let name = regex::escape(name);
    let re = Regex::new(&format!(r"(?s)<{name}>(.*?)</{name}>")).ok()?;
    let inner = re.captures(xml)?.get(1)?.as_str();
    let inner = inner
        .strip_prefix("<![CDATA[")
        .and_then(|rest| rest.strip_suffix("]]>"))
        .unwrap_or(inner);
    Some(inner.to_string())
}

/// Escapes text for use inside an element, including the characters the
/// chat client's quote parser chokes on.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\n' => out.push_str("&#x0A;"),
            '\t' => out.push_str("&#x09;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_attributes_and_cdata_tags() {
        let xml = r#"<msg fromnickname="Ann" content="hi there"><transferid><![CDATA[1000050]]></transferid><newmsgid>42</newmsgid></msg>"#;
        assert_eq!(attr(xml, "fromnickname").as_deref(), Some("Ann"));
        assert_eq!(attr(xml, "content").as_deref(), Some("hi there"));
        assert_eq!(attr(xml, "missing"), None);
        assert_eq!(tag(xml, "transferid").as_deref(), Some("1000050"));
        assert_eq!(tag(xml, "newmsgid").as_deref(), Some("42"));
    }

    #[test]
    fn attribute_names_match_whole_words() {
        let xml = r#"<msg bignickname="x" nickname="y"/>"#;
        assert_eq!(attr(xml, "nickname").as_deref(), Some("y"));
    }

    #[test]
    fn escape_covers_newlines_and_quotes() {
        assert_eq!(escape("a<b>\n\"c\"&"), "a&lt;b&gt;&#x0A;&quot;c&quot;&amp;");
    }
}
