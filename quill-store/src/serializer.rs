//! Canonical text serialization of items
//!
//! The wire payload is line based: title, blank line, body, blank line, then
//! `key: value` metadata lines ending with the `type_` discriminator. The
//! metadata block is parsed bottom-up so note bodies may contain anything,
//! including lines that look like metadata.

use crate::errors::{Result, StoreError};
use crate::item::{Item, ItemType};

fn escape_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\r', "\\r").replace('\n', "\\n")
}

fn unescape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn is_metadata_line(line: &str) -> bool {
    let Some((key, _)) = line.split_once(": ") else {
        // A bare "key:" line carries an empty value.
        let Some(key) = line.strip_suffix(':') else {
            return false;
        };
        return is_metadata_key(key);
    };
    is_metadata_key(key)
}

fn is_metadata_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// Serialize an item into its canonical payload.
pub fn serialize_item(item: &Item) -> String {
    let mut props: Vec<(&str, String)> = vec![
        ("id", item.id.clone()),
        ("parent_id", item.parent_id.clone()),
        ("created_time", item.created_time.to_string()),
        ("updated_time", item.updated_time.to_string()),
        ("user_created_time", item.user_created_time.to_string()),
        ("user_updated_time", item.user_updated_time.to_string()),
        (
            "encryption_applied",
            if item.encryption_applied { "1" } else { "0" }.to_string(),
        ),
        ("share_id", item.share_id.clone()),
    ];

    match item.item_type {
        ItemType::Note => props.push(("todo_completed", item.todo_completed.to_string())),
        ItemType::Resource => {
            props.push(("size", item.size.to_string()));
            props.push(("mime", item.mime.clone()));
            props.push(("filename", item.filename.clone()));
        }
        ItemType::NoteTag => {
            props.push(("note_id", item.note_id.clone()));
            props.push(("tag_id", item.tag_id.clone()));
        }
        ItemType::Revision => props.push(("item_id", item.rev_item_id.clone())),
        ItemType::MasterKey => props.push(("master_key_data", item.master_key_data.clone())),
        ItemType::Folder | ItemType::Tag => {}
    }

    props.push(("type_", item.item_type.as_i64().to_string()));

    let mut out = String::new();
    out.push_str(&escape_value(&item.title));
    out.push_str("\n\n");
    if !item.body.is_empty() {
        out.push_str(&item.body);
        out.push_str("\n\n");
    }
    for (i, (key, value)) in props.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(key);
        out.push_str(": ");
        out.push_str(&escape_value(value));
    }
    out
}

/// Parse a canonical payload back into an item.
pub fn deserialize_item(text: &str) -> Result<Item> {
    let lines: Vec<&str> = text.split('\n').collect();

    // Walk the metadata block bottom-up.
    let mut meta_start = lines.len();
    while meta_start > 0 && is_metadata_line(lines[meta_start - 1]) {
        meta_start -= 1;
    }
    if meta_start == lines.len() {
        return Err(StoreError::MalformedPayload(
            "no metadata block".to_string(),
        ));
    }

    let mut item_type: Option<ItemType> = None;
    let mut item = Item::new(ItemType::Note);
    item.id = String::new();
    item.parent_id = String::new();
    item.created_time = 0;
    item.updated_time = 0;
    item.user_created_time = 0;
    item.user_updated_time = 0;

    for line in &lines[meta_start..] {
        let (key, raw) = match line.split_once(": ") {
            Some((key, value)) => (key, value),
            None => (line.trim_end_matches(':'), ""),
        };
        let value = unescape_value(raw);
        match key {
            "id" => item.id = value,
            "parent_id" => item.parent_id = value,
            "created_time" => item.created_time = parse_ms(key, &value)?,
            "updated_time" => item.updated_time = parse_ms(key, &value)?,
            "user_created_time" => item.user_created_time = parse_ms(key, &value)?,
            "user_updated_time" => item.user_updated_time = parse_ms(key, &value)?,
            "encryption_applied" => item.encryption_applied = value == "1",
            "share_id" => item.share_id = value,
            "todo_completed" => item.todo_completed = parse_ms(key, &value)?,
            "size" => item.size = parse_ms(key, &value)?,
            "mime" => item.mime = value,
            "filename" => item.filename = value,
            "note_id" => item.note_id = value,
            "tag_id" => item.tag_id = value,
            "item_id" => item.rev_item_id = value,
            "master_key_data" => item.master_key_data = value,
            "type_" => {
                let n = parse_ms(key, &value)?;
                item_type = Some(ItemType::from_i64(n)?);
            }
            // Newer clients may write keys this client does not know about.
            _ => {}
        }
    }

    item.item_type = item_type
        .ok_or_else(|| StoreError::MalformedPayload("missing type_".to_string()))?;
    if item.id.is_empty() {
        return Err(StoreError::MalformedPayload("missing id".to_string()));
    }

    // Head section: title line, then body after the separating blank line.
    let mut head_end = meta_start;
    while head_end > 0 && lines[head_end - 1].is_empty() {
        head_end -= 1;
    }
    let head = &lines[..head_end];
    if !head.is_empty() {
        item.title = unescape_value(head[0]);
        if head.len() > 2 {
            item.body = head[2..].join("\n");
        }
    }

    Ok(item)
}

fn parse_ms(key: &str, value: &str) -> Result<i64> {
    value
        .parse::<i64>()
        .map_err(|_| StoreError::MalformedPayload(format!("bad integer for {}: {}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_round_trip() {
        let mut note = Item::new_note("My note", "line one\n\nline two", "parent123");
        note.todo_completed = 1234;
        let text = serialize_item(&note);
        let parsed = deserialize_item(&text).unwrap();
        assert_eq!(parsed.id, note.id);
        assert_eq!(parsed.item_type, ItemType::Note);
        assert_eq!(parsed.title, "My note");
        assert_eq!(parsed.body, "line one\n\nline two");
        assert_eq!(parsed.todo_completed, 1234);
        assert_eq!(parsed.updated_time, note.updated_time);
    }

    #[test]
    fn test_body_with_metadata_looking_lines() {
        let note = Item::new_note("t", "id: not-metadata\nsome: thing", "");
        let text = serialize_item(&note);
        let parsed = deserialize_item(&text).unwrap();
        // The body survives because only the trailing block is metadata.
        assert_eq!(parsed.body, "id: not-metadata\nsome: thing");
        assert_eq!(parsed.id, note.id);
    }

    #[test]
    fn test_folder_has_no_body_section() {
        let folder = Item::new_folder("Stuff");
        let text = serialize_item(&folder);
        let parsed = deserialize_item(&text).unwrap();
        assert_eq!(parsed.item_type, ItemType::Folder);
        assert_eq!(parsed.title, "Stuff");
        assert_eq!(parsed.body, "");
    }

    #[test]
    fn test_title_newline_escaped() {
        let note = Item::new_note("a\nb", "", "");
        let text = serialize_item(&note);
        let parsed = deserialize_item(&text).unwrap();
        assert_eq!(parsed.title, "a\nb");
    }

    #[test]
    fn test_resource_fields() {
        let res = Item::new_resource("photo.png", "image/png", 2048);
        let text = serialize_item(&res);
        let parsed = deserialize_item(&text).unwrap();
        assert_eq!(parsed.item_type, ItemType::Resource);
        assert_eq!(parsed.filename, "photo.png");
        assert_eq!(parsed.mime, "image/png");
        assert_eq!(parsed.size, 2048);
    }

    #[test]
    fn test_missing_type_is_error() {
        assert!(deserialize_item("hello\n\nid: abc").is_err());
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let note = Item::new_note("t", "", "");
        let mut text = serialize_item(&note);
        text = text.replace("type_:", "frobnication_level: 9\ntype_:");
        let parsed = deserialize_item(&text).unwrap();
        assert_eq!(parsed.id, note.id);
    }
}
