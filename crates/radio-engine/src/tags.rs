use std::path::Path;

use lofty::{Accessor, TaggedFileExt, read_from_path};

use crate::metadata::MetaData;

/// Artist and title from the file's embedded tags.
///
/// The primary tag wins; otherwise the first tag of any type is used. Files without
/// usable tags yield `None`.
pub fn read_track_tags(path: &Path) -> Option<MetaData> {
    let tagged_file = match read_from_path(path) {
        Ok(file) => file,
        Err(e) => {
            tracing::debug!(path = %path.display(), "no readable tags: {e}");
            return None;
        }
    };
    let tag = tagged_file
        .primary_tag()
        .or_else(|| tagged_file.first_tag())?;
    let artist = tag.artist();
    let title = tag.title().map(|t| strip_mid_suffix(&t).to_string());
    let meta = MetaData::new(artist.as_deref(), title.as_deref());
    (!meta.is_empty()).then_some(meta)
}

/// Split tracks are often tagged `"Title (Mid)"`; listeners should see `"Title"`.
pub fn strip_mid_suffix(title: &str) -> &str {
    const SUFFIX: &str = " (mid)";
    let trimmed = title.trim_end();
    let cut = trimmed.len().saturating_sub(SUFFIX.len());
    match trimmed.get(cut..) {
        Some(tail) if tail.eq_ignore_ascii_case(SUFFIX) => &trimmed[..cut],
        _ => trimmed,
    }
}
