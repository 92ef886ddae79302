use std::path::Path;

const FALLBACK_NAME: &str = "upload";
// NAME_MAX on common filesystems, in bytes
const MAX_FILE_NAME_BYTES: usize = 255;

/// Keep only the final path component of a client-supplied filename.
pub fn sanitize_original_name(original: &str) -> String {
    let normalized = original.replace('\\', "/");
    let name = Path::new(&normalized)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.trim())
        .unwrap_or("");

    if name.is_empty() || name == "." || name == ".." {
        FALLBACK_NAME.to_string()
    } else {
        name.to_string()
    }
}

/// Shorten `name` to at most `max_bytes`, cutting the stem and keeping the extension.
fn truncate_name(name: &str, max_bytes: usize) -> String {
    if name.len() <= max_bytes {
        return name.to_string();
    }

    let (stem, extension) = match name.rfind('.') {
        Some(dot) if dot > 0 && name.len() - dot < max_bytes => name.split_at(dot),
        _ => (name, ""),
    };
    let mut end = max_bytes - extension.len();
    while !stem.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &stem[..end], extension)
}

/// `<field>_<unix millis>_<original>`, kept within `MAX_FILE_NAME_BYTES`.
pub fn stored_file_name(field_name: &str, timestamp_millis: i64, original: &str) -> String {
    let prefix = format!("{}_{}_", field_name, timestamp_millis);
    let budget = MAX_FILE_NAME_BYTES.saturating_sub(prefix.len());
    format!(
        "{}{}",
        prefix,
        truncate_name(&sanitize_original_name(original), budget)
    )
}
