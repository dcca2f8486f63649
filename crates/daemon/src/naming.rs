//! Final output naming: Plex-compatible movie folders.
//!
//! With metadata: `Title (Year) {imdb-ttXXXX}/Title (Year) - NN.mkv`.
//! Without: a sanitized disc label stands in for the title.

use std::path::PathBuf;

use crate::jobs::DiscMetadata;

const MAX_NAME_LEN: usize = 200;

/// Strip characters invalid on common filesystems, collapse whitespace, trim
/// trailing dots, cap the length.
pub fn sanitize_name(name: &str) -> String {
    let stripped: String = name
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .collect();

    let mut collapsed = String::with_capacity(stripped.len());
    let mut last_was_space = false;
    for c in stripped.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                collapsed.push(' ');
            }
            last_was_space = true;
        } else {
            collapsed.push(c);
            last_was_space = false;
        }
    }

    let trimmed = collapsed.trim_matches(|c: char| c == ' ' || c == '.');
    trimmed.chars().take(MAX_NAME_LEN).collect()
}

/// Generates final library paths for a job's encoded outputs.
#[derive(Debug, Clone)]
pub struct OutputNamer {
    output_dir: PathBuf,
}

impl OutputNamer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Compute the final path for each of `count` outputs.
    ///
    /// A single output keeps the plain name; multiple outputs get a 1-based
    /// ` - NN` suffix so titles never collide inside the folder.
    pub fn final_paths(
        &self,
        metadata: Option<&DiscMetadata>,
        disc_label: Option<&str>,
        fallback: &str,
        count: usize,
    ) -> Vec<PathBuf> {
        let base = self.base_name(metadata, disc_label, fallback);
        let folder = self.folder_name(&base, metadata);
        let dir = self.output_dir.join(folder);

        (1..=count)
            .map(|n| {
                let file = if count == 1 {
                    format!("{base}.mkv")
                } else {
                    format!("{base} - {n:02}.mkv")
                };
                dir.join(file)
            })
            .collect()
    }

    /// `Title (Year)` from metadata, else a cleaned-up disc label, else the
    /// caller's fallback (typically the job id).
    fn base_name(
        &self,
        metadata: Option<&DiscMetadata>,
        disc_label: Option<&str>,
        fallback: &str,
    ) -> String {
        if let Some(meta) = metadata {
            let title = sanitize_name(&meta.title);
            if !title.is_empty() {
                return match meta.year {
                    Some(year) => format!("{title} ({year})"),
                    None => title,
                };
            }
        }

        let label = disc_label
            .map(|l| sanitize_name(&l.replace(['_', '.'], " ")))
            .filter(|l| !l.is_empty());
        label.unwrap_or_else(|| sanitize_name(fallback))
    }

    fn folder_name(&self, base: &str, metadata: Option<&DiscMetadata>) -> String {
        match metadata.and_then(|m| m.imdb_id.as_deref()) {
            Some(imdb) => format!("{base} {{imdb-{imdb}}}"),
            None => base.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn meta(title: &str, year: Option<u32>, imdb: Option<&str>) -> DiscMetadata {
        DiscMetadata {
            title: title.to_string(),
            year,
            imdb_id: imdb.map(str::to_string),
        }
    }

    #[test]
    fn test_sanitize_strips_invalid_chars() {
        assert_eq!(sanitize_name("Movie: The/Sequel?"), "Movie TheSequel");
        assert_eq!(sanitize_name("a<b>c\"d\\e|f*g"), "abcdefg");
    }

    #[test]
    fn test_sanitize_collapses_whitespace_and_trims_dots() {
        assert_eq!(sanitize_name("  Some   Movie .. "), "Some Movie");
    }

    #[test]
    fn test_full_metadata_paths() {
        let namer = OutputNamer::new("/media");
        let meta = meta("Example Movie", Some(2001), Some("tt0123456"));

        let paths = namer.final_paths(Some(&meta), Some("EXAMPLE_DISC"), "job-1", 2);

        assert_eq!(
            paths,
            vec![
                PathBuf::from(
                    "/media/Example Movie (2001) {imdb-tt0123456}/Example Movie (2001) - 01.mkv"
                ),
                PathBuf::from(
                    "/media/Example Movie (2001) {imdb-tt0123456}/Example Movie (2001) - 02.mkv"
                ),
            ]
        );
    }

    #[test]
    fn test_single_output_keeps_plain_name() {
        let namer = OutputNamer::new("/media");
        let meta = meta("Example Movie", Some(2001), None);

        let paths = namer.final_paths(Some(&meta), None, "job-1", 1);
        assert_eq!(
            paths,
            vec![PathBuf::from(
                "/media/Example Movie (2001)/Example Movie (2001).mkv"
            )]
        );
    }

    #[test]
    fn test_no_year() {
        let namer = OutputNamer::new("/media");
        let meta = meta("Example Movie", None, None);

        let paths = namer.final_paths(Some(&meta), None, "job-1", 1);
        assert_eq!(
            paths,
            vec![PathBuf::from("/media/Example Movie/Example Movie.mkv")]
        );
    }

    #[test]
    fn test_label_fallback_cleans_separators() {
        let namer = OutputNamer::new("/media");

        let paths = namer.final_paths(None, Some("EXAMPLE_MOVIE.DISC1"), "job-1", 1);
        assert_eq!(
            paths,
            vec![PathBuf::from(
                "/media/EXAMPLE MOVIE DISC1/EXAMPLE MOVIE DISC1.mkv"
            )]
        );
    }

    #[test]
    fn test_job_id_fallback_when_nothing_else() {
        let namer = OutputNamer::new("/media");
        let paths = namer.final_paths(None, None, "disc-ab12cd34", 1);
        assert_eq!(
            paths,
            vec![PathBuf::from("/media/disc-ab12cd34/disc-ab12cd34.mkv")]
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        // Sanitized names never carry filesystem-hostile characters and never
        // exceed the length cap.
        #[test]
        fn prop_sanitize_output_is_safe(name in ".*") {
            let cleaned = sanitize_name(&name);
            let no_hostile_chars = cleaned.chars().all(|c| {
                !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*')
            });
            prop_assert!(no_hostile_chars);
            prop_assert!(cleaned.chars().count() <= 200);
            prop_assert!(!cleaned.starts_with(' ') && !cleaned.ends_with(' '));
            prop_assert!(!cleaned.ends_with('.'));
        }

        // Every output path for a job lands in the same folder, and paths are
        // pairwise distinct.
        #[test]
        fn prop_paths_share_folder_and_are_distinct(count in 1usize..12) {
            let namer = OutputNamer::new("/media");
            let meta = DiscMetadata {
                title: "Example".to_string(),
                year: Some(2001),
                imdb_id: None,
            };
            let paths = namer.final_paths(Some(&meta), None, "job-1", count);

            prop_assert_eq!(paths.len(), count);
            let parent = paths[0].parent().unwrap();
            prop_assert!(paths.iter().all(|p| p.parent().unwrap() == parent));
            for (i, a) in paths.iter().enumerate() {
                for b in &paths[i + 1..] {
                    prop_assert_ne!(a, b);
                }
            }
        }
    }
}
