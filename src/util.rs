use std::{collections::BTreeSet, path::Path, path::PathBuf};

/// Files in `dir` with the given extension, sorted by stem.
pub async fn list_with_extension<P: AsRef<Path>>(
    dir: P,
    extension: &str,
) -> std::io::Result<Vec<(String, PathBuf)>> {
    let dir = dir.as_ref();
    let mut seen = BTreeSet::new();
    let mut items = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some(extension) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if seen.insert(stem.to_string()) {
                items.push((stem.to_string(), path.clone()));
            }
        }
    }
    items.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(items)
}

/// Extension of `filename` including the dot, or `fallback` when it has none.
pub fn extension_or(filename: &str, fallback: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions() {
        assert_eq!(extension_or("x.png", ".png"), ".png");
        assert_eq!(extension_or("clip.final.webp", ".png"), ".webp");
        assert_eq!(extension_or("noext", ".png"), ".png");
        assert_eq!(extension_or("trailing.", ".png"), ".png");
    }

    #[tokio::test]
    async fn lists_only_matching_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.json"), "{}").unwrap();
        std::fs::write(dir.path().join("a.json"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        let items = list_with_extension(dir.path(), "json").await.unwrap();
        let names: Vec<_> = items.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
