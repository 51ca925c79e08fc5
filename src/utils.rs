use anyhow::Result;
use std::path::{Path, PathBuf};
use url::Url;

pub const TEMP_DIR_NAME: &str = ".temp";
pub const SIDECAR_SUFFIX: &str = ".segments.json";

pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| sanitize_filename(&path.to_string_lossy()))
}

pub fn get_filename_from_url(url_str: &str) -> Result<String> {
    let url = Url::parse(url_str)?;

    if let Some(segments) = url.path_segments() {
        if let Some(filename) = segments.last() {
            if !filename.is_empty() {
                return Ok(filename.to_string());
            }
        }
    }

    Ok(format!("download_{}", uuid::Uuid::new_v4()))
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

/// Hidden folder next to the destination holding sidecars and segment files.
pub fn temp_dir_for(dest: &Path) -> PathBuf {
    dest.parent()
        .unwrap_or_else(|| Path::new("."))
        .join(TEMP_DIR_NAME)
}

pub fn sidecar_path_for(dest: &Path) -> PathBuf {
    temp_dir_for(dest).join(format!("{}{}", file_name_of(dest), SIDECAR_SUFFIX))
}

pub fn segment_path_for(dest: &Path, index: usize) -> PathBuf {
    temp_dir_for(dest).join(format!("{}_{}.part", file_name_of(dest), index))
}

/// Path the segments are concatenated into before replacing the destination.
pub fn merge_path_for(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Removes the sidecar and every segment file that belongs to `dest`, then
/// the temp folder itself when nothing else is left in it.
pub async fn remove_temp_artifacts(dest: &Path) -> std::io::Result<()> {
    let temp_dir = temp_dir_for(dest);
    let mut entries = match tokio::fs::read_dir(&temp_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    let name = file_name_of(dest);
    let sidecar = format!("{}{}", name, SIDECAR_SUFFIX);
    let sidecar_scratch = format!("{}.tmp", sidecar);
    let segment_prefix = format!("{}_", name);
    let mut others = 0usize;

    while let Some(entry) = entries.next_entry().await? {
        let entry_name = entry.file_name().to_string_lossy().into_owned();
        let ours = entry_name == sidecar
            || entry_name == sidecar_scratch
            || entry_name
                .strip_prefix(&segment_prefix)
                .and_then(|rest| rest.strip_suffix(".part"))
                .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()));
        if ours {
            tokio::fs::remove_file(entry.path()).await?;
        } else {
            others += 1;
        }
    }

    if others == 0 {
        tokio::fs::remove_dir(&temp_dir).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_layout_sits_next_to_destination() {
        let dest = Path::new("/game/assets/level1.ab");
        assert_eq!(temp_dir_for(dest), PathBuf::from("/game/assets/.temp"));
        assert_eq!(
            sidecar_path_for(dest),
            PathBuf::from("/game/assets/.temp/level1.ab.segments.json")
        );
        assert_eq!(
            segment_path_for(dest, 2),
            PathBuf::from("/game/assets/.temp/level1.ab_2.part")
        );
        assert_eq!(merge_path_for(dest), PathBuf::from("/game/assets/level1.ab.tmp"));
    }

    #[test]
    fn filename_from_url_path() {
        assert_eq!(
            get_filename_from_url("https://cdn.example.com/ab/main.ab?t=1").unwrap(),
            "main.ab"
        );
        assert!(get_filename_from_url("https://cdn.example.com/")
            .unwrap()
            .starts_with("download_"));
        assert!(get_filename_from_url("not a url").is_err());
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize_filename("a/b c.ab"), "a_b_c.ab");
    }

    #[tokio::test]
    async fn remove_artifacts_keeps_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.bin");
        let other = dir.path().join("b.bin");
        tokio::fs::create_dir_all(temp_dir_for(&dest)).await.unwrap();
        tokio::fs::write(sidecar_path_for(&dest), "{}").await.unwrap();
        tokio::fs::write(segment_path_for(&dest, 0), b"x").await.unwrap();
        tokio::fs::write(segment_path_for(&other, 0), b"y").await.unwrap();

        remove_temp_artifacts(&dest).await.unwrap();
        assert!(!sidecar_path_for(&dest).exists());
        assert!(!segment_path_for(&dest, 0).exists());
        assert!(segment_path_for(&other, 0).exists());

        remove_temp_artifacts(&other).await.unwrap();
        assert!(!temp_dir_for(&dest).exists());
    }

    #[tokio::test]
    async fn remove_artifacts_takes_interrupted_sidecar_write() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.bin");
        tokio::fs::create_dir_all(temp_dir_for(&dest)).await.unwrap();
        let mut scratch = sidecar_path_for(&dest).into_os_string();
        scratch.push(".tmp");
        tokio::fs::write(&scratch, "{").await.unwrap();
        tokio::fs::write(segment_path_for(&dest, 0), b"x").await.unwrap();

        remove_temp_artifacts(&dest).await.unwrap();
        assert!(!temp_dir_for(&dest).exists());
    }
}
