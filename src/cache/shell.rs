//! Sub-resource discovery in shell pages.

use url::Url;

/// Tags whose references are part of the shell.
const RESOURCE_TAGS: [&str; 3] = ["script", "link", "img"];
const ATTRIBUTES: [&str; 2] = ["src=", "href="];

/// URLs referenced by `src` and `href` attributes of `script`, `link` and
/// `img` tags in `html`, resolved against `base`, deduplicated in document
/// order. Fragments are dropped.
pub fn sub_resources(html: &str, base: &Url) -> Vec<Url> {
  let mut urls: Vec<Url> = Vec::new();
  let mut rest = html;

  while let Some(open) = rest.find('<') {
    let after = &rest[open + 1..];
    let Some(close) = tag_end(after) else {
      break;
    };
    let tag = &after[..close];
    rest = &after[close + 1..];

    let name_end = tag
      .find(|c: char| c.is_whitespace() || c == '/')
      .unwrap_or(tag.len());
    let name = tag[..name_end].to_ascii_lowercase();
    if !RESOURCE_TAGS.contains(&name.as_str()) {
      continue;
    }

    for value in attribute_values(&tag[name_end..]) {
      if let Ok(mut url) = base.join(value.trim()) {
        url.set_fragment(None);
        if !urls.contains(&url) {
          urls.push(url);
        }
      }
    }
  }
  urls
}

/// Offset of the `>` closing a tag, skipping quoted attribute values.
fn tag_end(s: &str) -> Option<usize> {
  let mut quote: Option<char> = None;
  for (i, c) in s.char_indices() {
    match (quote, c) {
      (Some(q), c) if c == q => quote = None,
      (Some(_), _) => {}
      (None, '"' | '\'') => quote = Some(c),
      (None, '>') => return Some(i),
      (None, _) => {}
    }
  }
  None
}

/// Quoted `src`/`href` values of one tag's attribute list, in order.
fn attribute_values(attrs: &str) -> Vec<&str> {
  let mut found: Vec<(usize, &str)> = Vec::new();
  let lower = attrs.to_ascii_lowercase();

  for attr in ATTRIBUTES {
    let mut offset = 0;
    while let Some(pos) = lower[offset..].find(attr) {
      let start = offset + pos;
      offset = start + attr.len();

      let preceded_by_space = attrs[..start]
        .chars()
        .next_back()
        .is_some_and(char::is_whitespace);
      if !preceded_by_space {
        continue;
      }
      if let Some(value) = quoted_value(&attrs[offset..]) {
        found.push((start, value));
      }
    }
  }

  found.sort_by_key(|(pos, _)| *pos);
  found.into_iter().map(|(_, value)| value).collect()
}

fn quoted_value(s: &str) -> Option<&str> {
  let quote = s.chars().next().filter(|c| *c == '"' || *c == '\'')?;
  let rest = &s[1..];
  let end = rest.find(quote)?;
  Some(&rest[..end])
}
