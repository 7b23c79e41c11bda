//! Just enough XML to walk the WIM metadata document: elements, attributes,
//! text and the five predefined entities.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element<'a> {
    pub name: &'a str,
    attributes: &'a str,
    pub inner: &'a str,
}

impl<'a> Element<'a> {
    pub fn attribute(&self, key: &str) -> Option<&'a str> {
        let needle = format!("{}=\"", key);
        let start = self.attributes.find(&needle)? + needle.len();
        let end = self.attributes[start..].find('"')? + start;
        Some(&self.attributes[start..end])
    }

    pub fn text(&self) -> String {
        unescape(self.inner.trim())
    }
}

/// Direct child elements of `content`, in document order.
pub fn children(content: &str) -> Vec<Element<'_>> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut pos = 0usize;
    let mut current: Option<(&str, &str, usize)> = None;

    while let Some(rel) = content[pos..].find('<') {
        let start = pos + rel;
        let Some(close) = content[start..].find('>') else {
            break;
        };
        let end = start + close;
        let tag = &content[start + 1..end];
        pos = end + 1;

        if tag.starts_with('?') || tag.starts_with('!') {
            continue;
        }
        if tag.starts_with('/') {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                if let Some((name, attributes, inner_start)) = current.take() {
                    out.push(Element {
                        name,
                        attributes,
                        inner: &content[inner_start..start],
                    });
                }
            }
            continue;
        }

        let self_closing = tag.ends_with('/');
        let tag = tag.trim_end_matches('/');
        let (name, attributes) = match tag.find(char::is_whitespace) {
            Some(split) => (&tag[..split], &tag[split..]),
            None => (tag, ""),
        };
        if depth == 0 {
            if self_closing {
                out.push(Element {
                    name,
                    attributes,
                    inner: "",
                });
                continue;
            }
            current = Some((name, attributes, pos));
        }
        if !self_closing {
            depth += 1;
        }
    }
    out
}

pub fn child<'a>(content: &'a str, name: &str) -> Option<Element<'a>> {
    children(content).into_iter().find(|e| e.name == name)
}

/// Follow a `/`-separated element path from `content`.
pub fn lookup(content: &str, path: &str) -> Option<String> {
    let mut element: Option<Element<'_>> = None;
    let mut scope = content;
    for part in path.split('/').filter(|p| !p.is_empty()) {
        let found = child(scope, part)?;
        scope = found.inner;
        element = Some(found);
    }
    element.map(|e| e.text())
}

/// Inner content of `<IMAGE INDEX="n">` under the `<WIM>` root.
pub fn image(xml: &str, index: u32) -> Option<&str> {
    let root = child(xml, "WIM")?;
    let wanted = index.to_string();
    children(root.inner)
        .into_iter()
        .find(|e| e.name == "IMAGE" && e.attribute("INDEX") == Some(wanted.as_str()))
        .map(|e| e.inner)
}

pub fn unescape(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
