//! Filename-to-group-key parsing.
//!
//! Simulation outputs encode their identity in the file name. Each pattern
//! family gets its own parser; callers choose the family explicitly instead of
//! falling through a list of expressions.
//!
//! | family            | example                           | group key                  |
//! |-------------------|-----------------------------------|----------------------------|
//! | `RawSeed`         | `sim_Tc99m_liver_3.w01.im`        | `sim_Tc99m_liver.w01`      |
//! | `AveragedSeed`    | `sim_Tc99m_liver.w01.avg.im`      | `sim_Tc99m_liver.w01`      |
//! | `CombinedSource`  | `combined_Tc99m_liver.w01.avg.im` | `combined_Tc99m_liver.w01` |
//!
//! `CombinedSource` names follow `<prefix>_<radionuclide>_<voi>.wNN.avg.<ext>`:
//! the window is required and the stem must carry the source tag, which is
//! read as window 1, radionuclide `Tc99m`, VOI `liver` above.

use crate::common::constants::AVERAGE_TAG;
use crate::domain::SourceTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternFamily {
    RawSeed,
    AveragedSeed,
    CombinedSource,
}

impl PatternFamily {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RawSeed => "raw-seed",
            Self::AveragedSeed => "averaged-seed",
            Self::CombinedSource => "combined-source",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub family: PatternFamily,
    pub group_key: String,
    pub stem: String,
    pub window: Option<u8>,
    pub seed: Option<u32>,
    pub source: Option<SourceTag>,
    pub extension: String,
}

impl ParsedName {
    /// Name of the simulation run that produced a raw seed output,
    /// e.g. `sim_Tc99m_liver_3`.
    pub fn run_name(&self) -> Option<String> {
        self.seed.map(|seed| format!("{}_{}", self.stem, seed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyExtractor {
    family: PatternFamily,
}

impl KeyExtractor {
    pub const fn new(family: PatternFamily) -> Self {
        Self { family }
    }

    pub const fn family(&self) -> PatternFamily {
        self.family
    }

    pub fn parse(&self, file_name: &str) -> Option<ParsedName> {
        let (base, rest) = file_name.split_once('.')?;
        let components: Vec<&str> = rest.split('.').collect();
        if base.is_empty() || components.iter().any(|component| component.is_empty()) {
            return None;
        }
        let (extension, middle) = components.split_last()?;

        match self.family {
            PatternFamily::RawSeed => parse_raw_seed(base, middle, extension),
            PatternFamily::AveragedSeed => {
                parse_averaged(base, middle, extension, PatternFamily::AveragedSeed)
            }
            PatternFamily::CombinedSource => {
                parse_averaged(base, middle, extension, PatternFamily::CombinedSource)
                    .filter(|parsed| parsed.window.is_some() && parsed.source.is_some())
            }
        }
    }
}

fn parse_raw_seed(base: &str, middle: &[&str], extension: &str) -> Option<ParsedName> {
    let (stem, seed_text) = base.rsplit_once('_')?;
    if stem.is_empty()
        || seed_text.is_empty()
        || !seed_text.bytes().all(|byte| byte.is_ascii_digit())
    {
        return None;
    }
    if middle.contains(&AVERAGE_TAG) {
        return None;
    }
    let seed = seed_text.parse::<u32>().ok()?;

    Some(ParsedName {
        family: PatternFamily::RawSeed,
        group_key: join_key(stem, middle),
        stem: stem.to_string(),
        window: window_from(middle),
        seed: Some(seed),
        source: source_tag_from_stem(stem),
        extension: extension.to_string(),
    })
}

fn parse_averaged(
    base: &str,
    middle: &[&str],
    extension: &str,
    family: PatternFamily,
) -> Option<ParsedName> {
    let (tag, qualifiers) = middle.split_last()?;
    if *tag != AVERAGE_TAG || qualifiers.contains(&AVERAGE_TAG) {
        return None;
    }

    Some(ParsedName {
        family,
        group_key: join_key(base, qualifiers),
        stem: base.to_string(),
        window: window_from(qualifiers),
        seed: None,
        source: source_tag_from_stem(base),
        extension: extension.to_string(),
    })
}

fn join_key(stem: &str, qualifiers: &[&str]) -> String {
    if qualifiers.is_empty() {
        stem.to_string()
    } else {
        format!("{}.{}", stem, qualifiers.join("."))
    }
}

/// Parses a `wNN` component; the window is always two zero-padded digits.
pub fn parse_window_component(component: &str) -> Option<u8> {
    let digits = component.strip_prefix('w')?;
    if digits.len() != 2 || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn window_from(components: &[&str]) -> Option<u8> {
    components
        .iter()
        .find_map(|component| parse_window_component(component))
}

fn source_tag_from_stem(stem: &str) -> Option<SourceTag> {
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() < 3 || parts.iter().any(|part| part.is_empty()) {
        return None;
    }
    Some(SourceTag {
        radionuclide: parts[parts.len() - 2].to_string(),
        voi: parts[parts.len() - 1].to_string(),
    })
}
