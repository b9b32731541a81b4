//! Extraction of tagged YAML documents embedded in the text output of the external program.
//!
//! A document starts with a `--- !<Tag>` line and ends with a line containing only `...`.
//! Documents that are not terminated yet (the program is still writing) are ignored.

#[derive(Debug, Clone, PartialEq)]
pub struct TaggedDoc {
    pub tag: String,
    pub body: String,
    /// Line (zero-based) where the document starts
    pub line: usize,
}

impl TaggedDoc {
    pub fn parse_body<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_yaml::from_str(&self.body)?)
    }
}

fn parse_doc_start(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("--- !")?;
    rest.split_whitespace().next()
}

/// Returns all complete tagged documents in `text`, in order of appearance.
pub fn tagged_docs(text: &str) -> Vec<TaggedDoc> {
    let mut docs = Vec::new();
    let mut current: Option<(String, usize, Vec<&str>)> = None;

    for (idx, line) in text.lines().enumerate() {
        if let Some((tag, start, body)) = current.as_mut() {
            if line.trim_end() == "..." {
                docs.push(TaggedDoc {
                    tag: std::mem::take(tag),
                    body: body.join("\n"),
                    line: *start,
                });
                current = None;
            } else if let Some(new_tag) = parse_doc_start(line) {
                log::debug!("Unterminated document `{tag}` at line {start}");
                current = Some((new_tag.to_string(), idx, Vec::new()));
            } else {
                body.push(line);
            }
        } else if let Some(tag) = parse_doc_start(line) {
            current = Some((tag.to_string(), idx, Vec::new()));
        }
    }
    docs
}

/// Returns the first complete document with the given tag.
pub fn find_doc(text: &str, tag: &str) -> Option<TaggedDoc> {
    tagged_docs(text).into_iter().find(|doc| doc.tag == tag)
}

#[cfg(test)]
mod tests {
    use super::{find_doc, tagged_docs};

    #[test]
    fn test_tagged_docs() {
        let text = r#"
 some output
--- !COMMENT
message: hello
...
garbage
--- !Autoparal
info:
    version: 1
...
"#;
        let docs = tagged_docs(text);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].tag, "COMMENT");
        assert_eq!(docs[0].body, "message: hello");
        assert_eq!(docs[1].tag, "Autoparal");
        assert_eq!(docs[1].line, 6);
    }

    #[test]
    fn test_unterminated_doc_ignored() {
        let text = "--- !WARNING\nmessage: x\n";
        assert!(tagged_docs(text).is_empty());
        assert!(find_doc(text, "WARNING").is_none());
    }

    #[test]
    fn test_restart_on_new_doc() {
        let text = "--- !WARNING\nmessage: x\n--- !ERROR\nmessage: y\n...\n";
        let docs = tagged_docs(text);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].tag, "ERROR");
    }
}
