// Editor command dispatch.
//
// Every command is planned by a pure function of the current selection and
// the command payload into document mutations; only `apply_mutations`
// touches the live document.

use serde::{Deserialize, Serialize};

use crate::engine::{AttrValue, Attributes, Field, LiveDocument};
use crate::sanitize::sanitize_fragment;

/// Caret or range in one field. `anchor` is where the selection started,
/// `head` where it ends; either may be larger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub field: Field,
    pub anchor: u32,
    pub head: u32,
}

impl Selection {
    pub fn caret(field: Field, at: u32) -> Self {
        Self { field, anchor: at, head: at }
    }

    pub fn range(field: Field, start: u32, end: u32) -> Self {
        Self { field, anchor: start, head: end }
    }

    pub fn start(&self) -> u32 {
        self.anchor.min(self.head)
    }

    pub fn end(&self) -> u32 {
        self.anchor.max(self.head)
    }

    pub fn len(&self) -> u32 {
        self.end() - self.start()
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mark {
    Bold,
    Italic,
    Underline,
    Strike,
    Code,
}

impl Mark {
    pub const ALL: [Mark; 5] = [Mark::Bold, Mark::Italic, Mark::Underline, Mark::Strike, Mark::Code];

    pub const fn attribute(self) -> &'static str {
        match self {
            Self::Bold => "bold",
            Self::Italic => "italic",
            Self::Underline => "underline",
            Self::Strike => "strike",
            Self::Code => "code",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EditorCommand {
    /// Replace the selection with text.
    InsertText { text: String },
    /// Paste externally supplied markup; sanitized before it is inserted.
    Paste { html: String },
    /// Delete the selection, or the character before a collapsed caret.
    DeleteBackward,
    DeleteForward,
    InsertParagraph,
    SetMark { mark: Mark, enabled: bool },
    SetLink { href: String },
    RemoveLink,
    ClearFormatting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Insert { field: Field, index: u32, text: String, attributes: Attributes },
    Delete { field: Field, index: u32, len: u32 },
    Format { field: Field, index: u32, len: u32, attributes: Attributes },
}

const LINK_ATTRIBUTE: &str = "link";

/// Resolve a command against a selection. Never reads the document.
pub fn plan(selection: Selection, command: &EditorCommand) -> Vec<Mutation> {
    let field = selection.field;
    let start = selection.start();
    let len = selection.len();

    match command {
        EditorCommand::InsertText { text } => replace_selection(selection, text.clone()),
        EditorCommand::Paste { html } => {
            let (clean, _) = sanitize_fragment(html);
            replace_selection(selection, clean)
        }
        EditorCommand::DeleteBackward => {
            if len > 0 {
                vec![Mutation::Delete { field, index: start, len }]
            } else if start > 0 {
                vec![Mutation::Delete { field, index: start - 1, len: 1 }]
            } else {
                Vec::new()
            }
        }
        EditorCommand::DeleteForward => {
            let len = len.max(1);
            vec![Mutation::Delete { field, index: start, len }]
        }
        EditorCommand::InsertParagraph => match field {
            Field::Title => Vec::new(),
            Field::Body => replace_selection(selection, "\n".to_string()),
        },
        EditorCommand::SetMark { mark, enabled } => {
            let value = if *enabled { AttrValue::Bool(true) } else { AttrValue::Clear };
            format_selection(selection, mark.attribute(), value)
        }
        EditorCommand::SetLink { href } => {
            if !is_safe_href(href) {
                return Vec::new();
            }
            format_selection(selection, LINK_ATTRIBUTE, AttrValue::Str(href.trim().to_string()))
        }
        EditorCommand::RemoveLink => format_selection(selection, LINK_ATTRIBUTE, AttrValue::Clear),
        EditorCommand::ClearFormatting => {
            if len == 0 {
                return Vec::new();
            }
            let mut attributes: Attributes = Mark::ALL
                .iter()
                .map(|mark| (mark.attribute().to_string(), AttrValue::Clear))
                .collect();
            attributes.insert(LINK_ATTRIBUTE.to_string(), AttrValue::Clear);
            vec![Mutation::Format { field, index: start, len, attributes }]
        }
    }
}

fn replace_selection(selection: Selection, text: String) -> Vec<Mutation> {
    let mut mutations = Vec::with_capacity(2);
    if !selection.is_collapsed() {
        mutations.push(Mutation::Delete {
            field: selection.field,
            index: selection.start(),
            len: selection.len(),
        });
    }
    if !text.is_empty() {
        mutations.push(Mutation::Insert {
            field: selection.field,
            index: selection.start(),
            text,
            attributes: Attributes::new(),
        });
    }
    mutations
}

fn format_selection(selection: Selection, key: &str, value: AttrValue) -> Vec<Mutation> {
    if selection.is_collapsed() {
        return Vec::new();
    }
    let mut attributes = Attributes::new();
    attributes.insert(key.to_string(), value);
    vec![Mutation::Format {
        field: selection.field,
        index: selection.start(),
        len: selection.len(),
        attributes,
    }]
}

fn is_safe_href(href: &str) -> bool {
    let normalized: String =
        href.trim().chars().filter(|c| !c.is_whitespace() && !c.is_control()).collect();
    let lowered = normalized.to_ascii_lowercase();
    !lowered.is_empty() && !lowered.starts_with("javascript:") && !lowered.starts_with("vbscript:")
}

/// Apply planned mutations in order, returning one encoded update per
/// mutation.
pub fn apply_mutations(document: &LiveDocument, mutations: &[Mutation]) -> Vec<Vec<u8>> {
    mutations
        .iter()
        .map(|mutation| match mutation {
            Mutation::Insert { field, index, text, attributes } => {
                document.insert(*field, *index, text, attributes)
            }
            Mutation::Delete { field, index, len } => document.remove(*field, *index, *len),
            Mutation::Format { field, index, len, attributes } => {
                document.format(*field, *index, *len, attributes)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(anchor: u32, head: u32) -> Selection {
        Selection { field: Field::Body, anchor, head }
    }

    #[test]
    fn insert_over_range_deletes_then_inserts() {
        let mutations = plan(body(8, 3), &EditorCommand::InsertText { text: "x".into() });
        assert_eq!(
            mutations,
            vec![
                Mutation::Delete { field: Field::Body, index: 3, len: 5 },
                Mutation::Insert {
                    field: Field::Body,
                    index: 3,
                    text: "x".into(),
                    attributes: Attributes::new()
                },
            ]
        );
    }

    #[test]
    fn backspace_at_start_is_a_no_op() {
        assert!(plan(body(0, 0), &EditorCommand::DeleteBackward).is_empty());
        assert_eq!(
            plan(body(4, 4), &EditorCommand::DeleteBackward),
            vec![Mutation::Delete { field: Field::Body, index: 3, len: 1 }]
        );
    }

    #[test]
    fn marks_need_a_range() {
        let command = EditorCommand::SetMark { mark: Mark::Bold, enabled: true };
        assert!(plan(body(2, 2), &command).is_empty());
        match plan(body(2, 6), &command).as_slice() {
            [Mutation::Format { index: 2, len: 4, attributes, .. }] => {
                assert_eq!(attributes.get("bold"), Some(&AttrValue::Bool(true)));
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn unsafe_links_are_refused() {
        for href in ["javascript:alert(1)", "  JavaScript:x", "java\tscript:x", ""] {
            assert!(plan(body(0, 4), &EditorCommand::SetLink { href: href.into() }).is_empty(), "{href:?}");
        }
        assert_eq!(plan(body(0, 4), &EditorCommand::SetLink { href: "https://a.dev".into() }).len(), 1);
    }

    #[test]
    fn paste_is_sanitized_before_planning() {
        let mutations = plan(
            body(0, 0),
            &EditorCommand::Paste { html: "<b>hi</b><script>x()</script>".into() },
        );
        assert_eq!(
            mutations,
            vec![Mutation::Insert {
                field: Field::Body,
                index: 0,
                text: "<b>hi</b>".into(),
                attributes: Attributes::new()
            }]
        );
    }

    #[test]
    fn titles_have_no_paragraphs() {
        assert!(plan(Selection::caret(Field::Title, 0), &EditorCommand::InsertParagraph).is_empty());
    }

    #[test]
    fn commands_deserialize_from_tagged_json() {
        let command: EditorCommand =
            serde_json::from_str(r#"{"type":"set_mark","mark":"italic","enabled":false}"#)
                .expect("command should parse");
        assert_eq!(command, EditorCommand::SetMark { mark: Mark::Italic, enabled: false });
    }

    #[test]
    fn applied_plan_edits_the_document() {
        let document = LiveDocument::with_client_id(1);
        apply_mutations(&document, &plan(body(0, 0), &EditorCommand::InsertText { text: "hello world".into() }));
        apply_mutations(&document, &plan(body(0, 5), &EditorCommand::SetMark { mark: Mark::Bold, enabled: true }));
        apply_mutations(&document, &plan(body(11, 11), &EditorCommand::DeleteBackward));

        assert_eq!(document.text_string(Field::Body), "hello worl");
        let runs = document.runs(Field::Body);
        assert_eq!(runs[0].text, "hello");
        assert_eq!(runs[0].attributes.get("bold"), Some(&AttrValue::Bool(true)));
    }

    #[test]
    fn deleting_next_to_an_emoji_removes_the_whole_character() {
        let document = LiveDocument::with_client_id(1);
        apply_mutations(&document, &plan(body(0, 0), &EditorCommand::InsertText { text: "a😀b😀c".into() }));

        apply_mutations(&document, &plan(body(3, 3), &EditorCommand::DeleteBackward));
        assert_eq!(document.text_string(Field::Body), "ab😀c");

        apply_mutations(&document, &plan(body(2, 2), &EditorCommand::DeleteForward));
        assert_eq!(document.text_string(Field::Body), "abc");
    }
}
