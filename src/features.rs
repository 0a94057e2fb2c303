//! Turns alignments into the training rows the tree learner consumes. Each
//! interior aligned letter becomes one row: the emitted phone as the label,
//! then a nine letter window centred on the letter, then the part of speech.
//! The window is cut from the alignment's letters padded with four `0` tokens
//! on each side, so near the word edges it contains the `#` boundary and then
//! `0` filler.
use crate::align::AlignedEntry;
use crate::error::LtsError;
use crate::progress::progress_bar;
use std::collections::BTreeSet;
use std::io::{self, Write};

/// The feature names handed to the learner's description file. The first
/// names the label column, entries tagged `ignore` are listed for the learner
/// but not offered as test features.
pub const DEFAULT_FEAT_NAMES: &[&str] = &[
    "Relation.LTS.down.name",
    "p.p.p.p.name ignore",
    "p.p.p.name",
    "p.p.name",
    "p.name",
    "name",
    "n.name",
    "n.n.name",
    "n.n.n.name",
    "n.n.n.n.name ignore",
    "pos ignore",
];

/// Number of context letters kept on each side of the centre.
const CONTEXT: usize = 4;

/// Index of the central letter feature, the one the training set is sharded
/// by.
pub fn central_feature(names: &[String]) -> Result<usize, LtsError> {
    names
        .iter()
        .position(|n| n == "name")
        .ok_or_else(|| LtsError::MalformedInput("feature names do not include \"name\"".into()))
}

/// One training sample: label, nine window letters, part of speech.
pub type FeatureRow = Vec<String>;

pub fn build_feat_rows(aligned: &[AlignedEntry]) -> Vec<FeatureRow> {
    let mut rows = vec![];
    for (i, entry) in aligned.iter().enumerate() {
        progress_bar(i, aligned.len());
        let mut letters: Vec<&str> = vec!["0"; CONTEXT];
        letters.extend(entry.path.iter().map(|(_, letter)| letter.as_str()));
        letters.extend(std::iter::repeat("0").take(CONTEXT));
        let phones = entry.path[1..entry.path.len() - 1]
            .iter()
            .map(|(phone, _)| phone.as_str());
        for (j, phone) in phones.enumerate() {
            let centre = j + CONTEXT + 1;
            let mut row = Vec::with_capacity(2 * CONTEXT + 3);
            row.push(phone.to_string());
            row.extend(
                letters[centre - CONTEXT..=centre + CONTEXT]
                    .iter()
                    .map(|l| l.to_string()),
            );
            row.push(entry.pos.clone());
            rows.push(row);
        }
    }
    rows
}

/// One whitespace separated row per line.
pub fn write_feats(rows: &[FeatureRow], writer: &mut impl Write) -> io::Result<()> {
    for row in rows {
        writeln!(writer, "{}", row.join(" "))?;
    }
    Ok(())
}

/// The feature description file: every feature name followed by the sorted
/// set of values its column takes across the whole training set.
pub fn write_description(
    rows: &[FeatureRow],
    names: &[String],
    writer: &mut impl Write,
) -> io::Result<()> {
    writeln!(writer, "(")?;
    for (i, name) in names.iter().enumerate() {
        let values: BTreeSet<&str> = rows
            .iter()
            .filter_map(|row| row.get(i))
            .map(|v| v.as_str())
            .collect();
        writeln!(writer, "({}", name)?;
        writeln!(writer, "{}", values.into_iter().collect::<Vec<_>>().join(" "))?;
        writeln!(writer, ")")?;
    }
    writeln!(writer, ")")
}
