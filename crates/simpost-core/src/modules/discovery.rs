//! Directory scanning and pattern-family selection.

use super::keys::{KeyExtractor, ParsedName, PatternFamily};
use crate::domain::{PipelineError, PipelineResult};
use globset::Glob;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub name: ParsedName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub family: PatternFamily,
    pub files: Vec<DiscoveredFile>,
    /// Set when only raw outputs of a single seed were found.
    pub single_seed: Option<u32>,
}

impl Discovery {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn windows(&self) -> BTreeSet<u8> {
        self.files.iter().filter_map(|file| file.name.window).collect()
    }
}

/// Lists regular files in `dir` whose names match the glob `pattern`, in
/// lexicographic order. Pairwise reduction depends on this order being stable.
pub fn list_matching(dir: &Path, pattern: &str) -> PipelineResult<Vec<PathBuf>> {
    let matcher = Glob::new(pattern)
        .map_err(|source| {
            PipelineError::internal(
                "SYS.DISCOVERY_PATTERN",
                format!("invalid discovery pattern '{}': {}", pattern, source),
            )
        })?
        .compile_matcher();

    let entries = fs::read_dir(dir).map_err(|source| {
        PipelineError::io_system(
            "IO.DISCOVERY_READ_DIR",
            format!("failed to list directory '{}': {}", dir.display(), source),
        )
    })?;

    let mut matches = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| {
            PipelineError::io_system(
                "IO.DISCOVERY_READ_DIR",
                format!("failed to list directory '{}': {}", dir.display(), source),
            )
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if matcher.is_match(file_name) {
            matches.push(path);
        }
    }
    matches.sort();
    Ok(matches)
}

/// Lists files matching `pattern` and keeps the ones `family` can parse.
pub fn discover_family(
    dir: &Path,
    pattern: &str,
    family: PatternFamily,
) -> PipelineResult<Vec<DiscoveredFile>> {
    let extractor = KeyExtractor::new(family);
    Ok(list_matching(dir, pattern)?
        .into_iter()
        .filter_map(|path| {
            let name = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| extractor.parse(name))?;
            Some(DiscoveredFile { path, name })
        })
        .collect())
}

/// Picks the windowed image family to aggregate.
///
/// Averaged outputs win. Raw seed outputs are used only when no averaged
/// outputs exist and they all come from one seed; several seeds without
/// averages means the averaging stage has not run yet.
pub fn select_windowed_family(
    dir: &Path,
    prefix: &str,
    extension: &str,
) -> PipelineResult<Discovery> {
    let averaged = discover_family(
        dir,
        &format!("{}*w??.avg.{}", prefix, extension),
        PatternFamily::AveragedSeed,
    )?
    .into_iter()
    .filter(|file| file.name.window.is_some())
    .collect::<Vec<_>>();

    if !averaged.is_empty() {
        return Ok(Discovery {
            family: PatternFamily::AveragedSeed,
            files: averaged,
            single_seed: None,
        });
    }

    let raw = discover_family(
        dir,
        &format!("{}*w??.{}", prefix, extension),
        PatternFamily::RawSeed,
    )?
    .into_iter()
    .filter(|file| file.name.window.is_some())
    .collect::<Vec<_>>();

    let seeds: BTreeSet<u32> = raw.iter().filter_map(|file| file.name.seed).collect();
    if seeds.len() > 1 {
        let first = seeds.first().copied().unwrap_or_default();
        let last = seeds.last().copied().unwrap_or_default();
        return Err(PipelineError::configuration(
            "CONFIG.AMBIGUOUS_SEEDS",
            format!(
                "found raw outputs for {} seeds ({}..={}) in '{}' but no averaged images; run `simpost average` first",
                seeds.len(),
                first,
                last,
                dir.display()
            ),
        ));
    }

    let single_seed = seeds.first().copied();
    if let Some(seed) = single_seed {
        info!(
            seed,
            "no averaged images found; continuing with single seed outputs"
        );
    }

    Ok(Discovery {
        family: PatternFamily::RawSeed,
        files: raw,
        single_seed,
    })
}

#[cfg(test)]
mod tests {
    use super::{list_matching, select_windowed_family};
    use crate::domain::ErrorCategory;
    use crate::modules::keys::PatternFamily;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"").expect("file should be written");
    }

    #[test]
    fn listing_is_sorted_and_glob_filtered() {
        let temp = TempDir::new().expect("tempdir should be created");
        for name in ["sim_b.w01.avg.im", "sim_a.w01.avg.im", "sim_a.w01.im", "ct.im"] {
            touch(temp.path(), name);
        }

        let matches = list_matching(temp.path(), "sim*w??.avg.im").expect("listing");
        let names: Vec<_> = matches
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["sim_a.w01.avg.im", "sim_b.w01.avg.im"]);
    }

    #[test]
    fn averaged_family_is_preferred_over_raw() {
        let temp = TempDir::new().expect("tempdir should be created");
        touch(temp.path(), "sim_Tc99m_liver_1.w01.im");
        touch(temp.path(), "sim_Tc99m_liver_2.w01.im");
        touch(temp.path(), "sim_Tc99m_liver.w01.avg.im");
        touch(temp.path(), "sim_Tc99m_liver.w02.avg.im");

        let discovery = select_windowed_family(temp.path(), "sim", "im").expect("discovery");
        assert_eq!(discovery.family, PatternFamily::AveragedSeed);
        assert_eq!(discovery.files.len(), 2);
        assert_eq!(discovery.windows().into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn single_seed_raw_outputs_are_accepted() {
        let temp = TempDir::new().expect("tempdir should be created");
        touch(temp.path(), "sim_Tc99m_liver_5.w01.im");
        touch(temp.path(), "sim_Tc99m_spleen_5.w01.im");

        let discovery = select_windowed_family(temp.path(), "sim", "im").expect("discovery");
        assert_eq!(discovery.family, PatternFamily::RawSeed);
        assert_eq!(discovery.single_seed, Some(5));
        assert_eq!(discovery.files.len(), 2);
    }

    #[test]
    fn several_raw_seeds_without_averages_is_a_configuration_error() {
        let temp = TempDir::new().expect("tempdir should be created");
        touch(temp.path(), "sim_Tc99m_liver_1.w01.im");
        touch(temp.path(), "sim_Tc99m_liver_2.w01.im");

        let error =
            select_windowed_family(temp.path(), "sim", "im").expect_err("seeds are ambiguous");
        assert_eq!(error.category(), ErrorCategory::Configuration);
        assert_eq!(error.code(), "CONFIG.AMBIGUOUS_SEEDS");
        assert!(error.message().contains("simpost average"));
    }

    #[test]
    fn empty_directory_yields_empty_index_space() {
        let temp = TempDir::new().expect("tempdir should be created");
        let discovery = select_windowed_family(temp.path(), "sim", "im").expect("discovery");
        assert!(discovery.is_empty());
        assert!(discovery.windows().is_empty());
        assert_eq!(discovery.single_seed, None);
    }
}
