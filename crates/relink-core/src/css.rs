//! `url(...)` token scanning for inline CSS.
//!
//! Tokens are located by delimiter search: find `url(`, then either the
//! matching quote or the first `)`. Quoting and surrounding whitespace are
//! preserved exactly, so an unchanged token round-trips byte for byte.

const URL_OPEN: &str = "url(";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UrlToken<'a> {
    leading: &'a str,
    quote: Option<char>,
    value: &'a str,
    trailing: &'a str,
}

pub fn has_font_face(css: &str) -> bool {
    css.contains("@font-face")
}

/// Every `url(...)` value in `css`, unquoted, in source order.
pub fn css_urls(css: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = css;
    while let Some(open) = find_url_open(rest) {
        let body = &rest[open + URL_OPEN.len()..];
        let Some(close) = token_close(body) else {
            break;
        };
        out.push(parse_token(&body[..close]).value);
        rest = &body[close..];
    }
    out
}

/// Rewrites each `url(...)` value with `rewrite`.
///
/// `data:` URIs are never handed to `rewrite`. Returns `None` when no value
/// changed, so callers can skip writing the text back.
pub fn rewrite_css_urls<F>(css: &str, mut rewrite: F) -> Option<String>
where
    F: FnMut(&str) -> String,
{
    let mut out = String::with_capacity(css.len());
    let mut changed = false;
    let mut rest = css;

    while let Some(open) = find_url_open(rest) {
        let head_end = open + URL_OPEN.len();
        let body = &rest[head_end..];
        let Some(close) = token_close(body) else {
            break;
        };
        out.push_str(&rest[..head_end]);

        let token = parse_token(&body[..close]);
        let replacement = if token.value.starts_with("data:") || token.value.is_empty() {
            token.value.to_string()
        } else {
            rewrite(token.value)
        };
        if replacement != token.value {
            changed = true;
        }

        out.push_str(token.leading);
        if let Some(q) = token.quote {
            out.push(q);
        }
        out.push_str(&replacement);
        if let Some(q) = token.quote {
            out.push(q);
        }
        out.push_str(token.trailing);

        rest = &body[close..];
    }
    out.push_str(rest);

    changed.then_some(out)
}

/// Offset of the next `url(` that starts a token, skipping identifiers that
/// merely end in `url` (`myurl(`).
fn find_url_open(css: &str) -> Option<usize> {
    let mut from = 0usize;
    while let Some(found) = css[from..].find(URL_OPEN) {
        let idx = from + found;
        let starts_token = css[..idx]
            .chars()
            .next_back()
            .is_none_or(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        if starts_token {
            return Some(idx);
        }
        from = idx + URL_OPEN.len();
    }
    None
}

/// Offset of the `)` closing the token that starts at `body`.
fn token_close(body: &str) -> Option<usize> {
    let lead = body.len() - body.trim_start().len();
    let inner = &body[lead..];
    match inner.chars().next() {
        Some(q @ ('"' | '\'')) => {
            let end_quote = inner[1..].find(q)? + 1;
            let close = inner[end_quote + 1..].find(')')? + end_quote + 1;
            Some(lead + close)
        }
        _ => body.find(')'),
    }
}

fn parse_token(raw: &str) -> UrlToken<'_> {
    let trimmed_start = raw.trim_start();
    let leading = &raw[..raw.len() - trimmed_start.len()];
    let core = trimmed_start.trim_end();
    let trailing = &trimmed_start[core.len()..];

    let quote = core
        .chars()
        .next()
        .filter(|c| matches!(c, '"' | '\''))
        .filter(|q| core.len() >= 2 && core.ends_with(*q));
    let value = match quote {
        Some(_) => &core[1..core.len() - 1],
        None => core,
    };

    UrlToken {
        leading,
        quote,
        value,
        trailing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FONT_FACE: &str = r#"@font-face{font-family:"Inter";src:url(/_next/static/media/inter.woff2) format("woff2"),url( '/fonts/inter.woff' ) format("woff");}"#;

    #[test]
    fn lists_urls_in_order() {
        assert_eq!(
            css_urls(FONT_FACE),
            vec!["/_next/static/media/inter.woff2", "/fonts/inter.woff"]
        );
    }

    #[test]
    fn rewrites_values_and_preserves_quoting() {
        let out = rewrite_css_urls(FONT_FACE, |v| format!(".{v}")).expect("should change");
        assert_eq!(
            out,
            r#"@font-face{font-family:"Inter";src:url(./_next/static/media/inter.woff2) format("woff2"),url( './fonts/inter.woff' ) format("woff");}"#
        );
    }

    #[test]
    fn unchanged_text_returns_none() {
        assert_eq!(rewrite_css_urls(FONT_FACE, |v| v.to_string()), None);
        assert_eq!(rewrite_css_urls("body{color:red}", |v| format!("x{v}")), None);
    }

    #[test]
    fn data_uris_are_not_rewritten() {
        let css = "src:url(data:font/woff2;base64,AAAA)";
        assert_eq!(rewrite_css_urls(css, |_| "nope".to_string()), None);
    }

    #[test]
    fn quoted_value_may_contain_parenthesis() {
        let css = r#"a{background:url("/images/a(1).png")}"#;
        assert_eq!(css_urls(css), vec!["/images/a(1).png"]);
        let out = rewrite_css_urls(css, |v| format!(".{v}")).expect("should change");
        assert_eq!(out, r#"a{background:url("./images/a(1).png")}"#);
    }

    #[test]
    fn identifier_suffix_is_not_a_token() {
        assert_eq!(css_urls("--myurl(x); b:url(y)"), vec!["y"]);
    }

    #[test]
    fn unterminated_token_is_left_alone() {
        let css = "src:url(/fonts/a.woff";
        assert_eq!(css_urls(css), Vec::<&str>::new());
        assert_eq!(rewrite_css_urls(css, |v| format!(".{v}")), None);
    }

    #[test]
    fn font_face_detection() {
        assert!(has_font_face(FONT_FACE));
        assert!(!has_font_face("body{}"));
    }
}
