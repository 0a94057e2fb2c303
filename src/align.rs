//! Letter to phone alignment. Training data gives us whole words against
//! whole phone sequences, but the tree learner needs to know which letter
//! produced which phone. We recover that with a two pass search over the
//! alignments permitted by the allowables table:
//!
//! 1. Enumerate every legal alignment of every entry and count how often each
//!    letter/phone pair occurs, then turn the counts into probabilities.
//! 2. Rerun the search per entry keeping only the alignment with the highest
//!    total probability.
//!
//! A letter may consume no phone (an epsilon insertion, the silent `e` in
//! "name") or two phones at once (a fusion such as `g-z` for `x`). Both moves
//! are only taken when the allowables table lists them for that letter.
use crate::error::LtsError;
use crate::lexicon::{word_letters, Lexicon};
use crate::progress::progress_bar;
use crate::sexpr;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, prelude::*};
use std::path::Path;
use tracing::{debug, info};

/// The phone emitted for a silent letter.
pub const EPSILON: &str = "_epsilon_";
/// The word boundary symbol padded onto both ends of letters and phones.
pub const BOUNDARY: &str = "#";

/// Pass 1 is worst case exponential in the word length. Entries that reach
/// this many complete alignments are abandoned and reported as failures
/// rather than allowed to chew through memory.
const MAX_ALIGNS_PER_ENTRY: usize = 100_000;

/// The letter to allowed-phones table that prunes the alignment search. Read
/// from a JSON object of `{ letter: [phone, ...] }`, which must map `#` to
/// `["#"]` so the boundary can only align with itself.
#[derive(Debug, Clone, Default)]
pub struct Allowables {
    map: BTreeMap<String, BTreeSet<String>>,
}

impl Allowables {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::from_reader(io::BufReader::new(file))
    }

    pub fn from_reader(reader: impl Read) -> anyhow::Result<Self> {
        let map: BTreeMap<String, Vec<String>> = serde_json::from_reader(reader)?;
        let map = map
            .into_iter()
            .map(|(k, v)| (k, v.into_iter().collect()))
            .collect();
        let table = Self { map };
        match table.phones(BOUNDARY) {
            Some(phones) if phones.len() == 1 && phones.contains(BOUNDARY) => Ok(table),
            _ => Err(LtsError::MalformedInput(
                "allowables must map \"#\" to [\"#\"]".into(),
            )
            .into()),
        }
    }

    pub fn contains_letter(&self, letter: &str) -> bool {
        self.map.contains_key(letter)
    }

    pub fn phones(&self, letter: &str) -> Option<&BTreeSet<String>> {
        self.map.get(letter)
    }

    /// Every trainable letter, sorted, with the boundary symbol removed.
    pub fn letters(&self) -> Vec<String> {
        self.map
            .keys()
            .filter(|k| *k != BOUNDARY)
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.map.iter()
    }
}

impl FromIterator<(String, Vec<String>)> for Allowables {
    fn from_iter<I: IntoIterator<Item = (String, Vec<String>)>>(iter: I) -> Self {
        let map = iter
            .into_iter()
            .map(|(k, v)| (k, v.into_iter().collect()))
            .collect();
        Self { map }
    }
}

/// Letter to phone co-occurrence counts, seeded with a zero for every pair the
/// allowables permit so membership tests and normalisation both see the full
/// domain.
#[derive(Debug, Clone)]
pub struct CooccurrenceTable {
    counts: BTreeMap<String, BTreeMap<String, f64>>,
}

impl CooccurrenceTable {
    pub fn new(allowables: &Allowables) -> Self {
        let mut counts: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        for (letter, phones) in allowables.iter() {
            let row = counts.entry(letter.clone()).or_default();
            for phone in phones {
                row.insert(phone.clone(), 0.0);
            }
        }
        Self { counts }
    }

    pub fn valid_pair(&self, phone: &str, letter: &str) -> bool {
        self.counts
            .get(letter)
            .map_or(false, |row| row.contains_key(phone))
    }

    pub fn valid_fused_pair(&self, phone: &str, next_phone: &str, letter: &str) -> bool {
        self.counts
            .get(letter)
            .map_or(false, |row| row.contains_key(&fuse(phone, next_phone)))
    }

    /// Records one observed pair. Boundary-to-boundary pairs carry no
    /// information and pairs with exactly one boundary side never occur in a
    /// legal alignment, so both are skipped.
    fn cumulate(&mut self, phone: &str, letter: &str) {
        if phone == BOUNDARY || letter == BOUNDARY {
            return;
        }
        let score = if phone == EPSILON { 0.1 } else { 1.0 };
        if let Some(entry) = self
            .counts
            .get_mut(letter)
            .and_then(|row| row.get_mut(phone))
        {
            *entry += score;
        }
    }

    /// Returns a copy of the table with every row rescaled to probabilities.
    /// Rows with no observations stay all zero.
    pub fn normalised(&self) -> Self {
        let mut counts = self.counts.clone();
        for row in counts.values_mut() {
            let total: f64 = row.values().sum();
            if total > 0.0 {
                for value in row.values_mut() {
                    *value /= total;
                }
            }
        }
        Self { counts }
    }

    pub fn score(&self, phone: &str, letter: &str) -> f64 {
        self.counts
            .get(letter)
            .and_then(|row| row.get(phone))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn rows(&self) -> impl Iterator<Item = (&String, &BTreeMap<String, f64>)> {
        self.counts.iter()
    }
}

fn fuse(phone: &str, next_phone: &str) -> String {
    format!("{}-{}", phone, next_phone)
}

/// One (phone, letter) pair sequence covering a boundary-padded word. The
/// first and last pairs are always `(#, #)`.
pub type Alignment = Vec<(String, String)>;

/// An entry the aligner could not fit any legal path to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlignFailure {
    pub word: String,
    pub phones: String,
}

/// An aligned heteronym ready for feature extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedEntry {
    pub pos: String,
    pub path: Alignment,
}

/// Finds every alignment the table permits. `None` means the entry blew the
/// [`MAX_ALIGNS_PER_ENTRY`] budget and should be treated as failed.
fn find_all_aligns(
    phones: &[String],
    letters: &[String],
    table: &CooccurrenceTable,
    budget: &mut usize,
) -> Option<Vec<Alignment>> {
    if phones.len() == 1 && letters.len() == 1 && phones[0] == BOUNDARY && letters[0] == BOUNDARY {
        if *budget == 0 {
            return None;
        }
        *budget -= 1;
        return Some(vec![vec![(BOUNDARY.to_string(), BOUNDARY.to_string())]]);
    }
    let Some(letter) = letters.first() else {
        return Some(vec![]);
    };
    let mut found = vec![];
    if table.valid_pair(EPSILON, letter) {
        for mut path in find_all_aligns(phones, &letters[1..], table, budget)? {
            path.insert(0, (EPSILON.to_string(), letter.clone()));
            found.push(path);
        }
    }
    if let Some(phone) = phones.first() {
        if table.valid_pair(phone, letter) {
            for mut path in find_all_aligns(&phones[1..], &letters[1..], table, budget)? {
                path.insert(0, (phone.clone(), letter.clone()));
                found.push(path);
            }
        }
    }
    if phones.len() > 1 && table.valid_fused_pair(&phones[0], &phones[1], letter) {
        for mut path in find_all_aligns(&phones[2..], &letters[1..], table, budget)? {
            path.insert(0, (fuse(&phones[0], &phones[1]), letter.clone()));
            found.push(path);
        }
    }
    Some(found)
}

fn bound(items: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(items.len() + 2);
    out.push(BOUNDARY.to_string());
    out.extend(items.iter().cloned());
    out.push(BOUNDARY.to_string());
    out
}

/// Pass 1: accumulate co-occurrence counts over every alignment of every
/// entry. Returns the entries no alignment could be found for, these are
/// dropped from the rest of the pipeline.
pub fn cumulate_pairs(lexicon: &Lexicon, table: &mut CooccurrenceTable) -> Vec<AlignFailure> {
    let mut failures = vec![];
    let mut entry_count = 0usize;
    for (i, (word, heteronyms)) in lexicon.iter().enumerate() {
        progress_bar(i, lexicon.len());
        let bound_letters = bound(&word_letters(word));
        for heteronym in heteronyms {
            entry_count += 1;
            let bound_phones = bound(&heteronym.phones);
            let mut budget = MAX_ALIGNS_PER_ENTRY;
            let all_aligns = find_all_aligns(&bound_phones, &bound_letters, table, &mut budget);
            match all_aligns {
                Some(aligns) if !aligns.is_empty() => {
                    for align in &aligns {
                        for (phone, letter) in align {
                            table.cumulate(phone, letter);
                        }
                    }
                }
                _ => {
                    failures.push(AlignFailure {
                        word: word.clone(),
                        phones: heteronym.phones.join(" "),
                    });
                }
            }
        }
    }
    for failure in &failures {
        debug!("{}: {}", failure.word, failure.phones);
    }
    info!("Failed aligns: {}/{}", failures.len(), entry_count);
    failures
}

struct BestAlign {
    score: f64,
    epsilon_score: usize,
    path: Alignment,
}

fn search_best(
    phones: &[String],
    letters: &[String],
    table: &CooccurrenceTable,
    path: &mut Alignment,
    score: f64,
    best: &mut Option<BestAlign>,
) {
    if letters.is_empty() {
        let epsilon_score = path
            .iter()
            .enumerate()
            .filter(|(_, (phone, _))| phone == EPSILON)
            .map(|(i, _)| i)
            .sum();
        let better = match best {
            None => true,
            Some(b) => {
                score > b.score || (score == b.score && epsilon_score > b.epsilon_score)
            }
        };
        if better {
            *best = Some(BestAlign {
                score,
                epsilon_score,
                path: path.clone(),
            });
        }
        return;
    }
    let letter = &letters[0];
    if table.valid_pair(EPSILON, letter) {
        path.push((EPSILON.to_string(), letter.clone()));
        search_best(
            phones,
            &letters[1..],
            table,
            path,
            score + table.score(EPSILON, letter),
            best,
        );
        path.pop();
    }
    if let Some(phone) = phones.first() {
        if table.valid_pair(phone, letter) {
            path.push((phone.clone(), letter.clone()));
            search_best(
                &phones[1..],
                &letters[1..],
                table,
                path,
                score + table.score(phone, letter),
                best,
            );
            path.pop();
        }
    }
    if phones.len() > 1 && table.valid_fused_pair(&phones[0], &phones[1], letter) {
        let fused = fuse(&phones[0], &phones[1]);
        let pair_score = table.score(&fused, letter);
        path.push((fused, letter.clone()));
        search_best(&phones[2..], &letters[1..], table, path, score + pair_score, best);
        path.pop();
    }
}

/// Pass 2: the single highest scoring alignment for one entry. Ties are
/// broken by the index-weighted count of epsilons, preferring paths whose
/// silent letters sit later in the word - "trailing silent letter" patterns
/// such as the English final `e`.
pub fn find_best_alignment(
    phones: &[String],
    letters: &[String],
    table: &CooccurrenceTable,
) -> Option<Alignment> {
    let mut best = None;
    let mut path = Vec::new();
    search_best(phones, letters, table, &mut path, 0.0, &mut best);
    best.map(|b| b.path)
}

/// Aligns every entry of the filtered lexicon with the normalised table.
pub fn align_data(
    lexicon: &Lexicon,
    table: &CooccurrenceTable,
) -> (Vec<AlignedEntry>, Vec<AlignFailure>) {
    let mut good = vec![];
    let mut failed = vec![];
    for (i, (word, heteronyms)) in lexicon.iter().enumerate() {
        progress_bar(i, lexicon.len());
        let bound_letters = bound(&word_letters(word));
        for heteronym in heteronyms {
            let bound_phones = bound(&heteronym.phones);
            match find_best_alignment(&bound_phones, &bound_letters, table) {
                Some(path) if !path.is_empty() => good.push(AlignedEntry {
                    pos: heteronym.pos.clone(),
                    path,
                }),
                _ => failed.push(AlignFailure {
                    word: word.clone(),
                    phones: heteronym.phones.join(" "),
                }),
            }
        }
    }
    (good, failed)
}

/// Writes one `( ( l1 l2 ... ) pos p1 p2 ... )` line per entry with the
/// boundary pairs stripped.
pub fn save_lex_align(entries: &[AlignedEntry], writer: &mut impl Write) -> io::Result<()> {
    for entry in entries {
        let interior = &entry.path[1..entry.path.len() - 1];
        let letters: Vec<&str> = interior.iter().map(|(_, l)| l.as_str()).collect();
        let phones: Vec<&str> = interior.iter().map(|(p, _)| p.as_str()).collect();
        writeln!(
            writer,
            "( ( {} ) {} {} )",
            letters.join(" "),
            entry.pos,
            phones.join(" ")
        )?;
    }
    Ok(())
}

/// One reloaded alignment file line.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignRecord {
    pub letters: Vec<String>,
    pub pos: String,
    pub phones: Vec<String>,
}

/// Reads an alignment file back, skipping an `MNCL` magic header if present.
pub fn read_align(reader: impl BufRead) -> anyhow::Result<Vec<AlignRecord>> {
    let mut records = vec![];
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() || (i == 0 && line.trim_end() == "MNCL") {
            continue;
        }
        let parsed = sexpr::parse(&line)?;
        let items = parsed
            .as_list()
            .filter(|items| items.len() >= 2)
            .ok_or_else(|| LtsError::MalformedInput(format!("bad alignment line: {}", line)))?;
        let letters = items[0]
            .as_list()
            .ok_or_else(|| LtsError::MalformedInput(format!("bad alignment line: {}", line)))?
            .iter()
            .filter_map(|v| v.atom_text())
            .collect();
        let pos = items[1]
            .atom_text()
            .ok_or_else(|| LtsError::MalformedInput(format!("bad alignment line: {}", line)))?;
        let phones = items[2..].iter().filter_map(|v| v.atom_text()).collect();
        records.push(AlignRecord {
            letters,
            pos,
            phones,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexicon::Heteronym;
    use std::io::Cursor;

    fn table_for(entries: &[(&str, &[&str])]) -> CooccurrenceTable {
        let allowables: Allowables = entries
            .iter()
            .map(|(l, ps)| {
                (
                    l.to_string(),
                    ps.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
                )
            })
            .collect();
        CooccurrenceTable::new(&allowables)
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn pairs(items: &[(&str, &str)]) -> Alignment {
        items
            .iter()
            .map(|(p, l)| (p.to_string(), l.to_string()))
            .collect()
    }

    #[test]
    fn allowables_must_anchor_boundary() {
        let good = Cursor::new(r##"{"#": ["#"], "a": ["aa1"]}"##);
        assert!(Allowables::from_reader(good).is_ok());
        let missing = Cursor::new(r#"{"a": ["aa1"]}"#);
        assert!(Allowables::from_reader(missing).is_err());
        let wrong = Cursor::new(r##"{"#": ["#", "x"], "a": ["aa1"]}"##);
        assert!(Allowables::from_reader(wrong).is_err());
    }

    #[test]
    fn enumerates_epsilon_and_one_to_one_paths() {
        let table = table_for(&[
            ("a", &["x", EPSILON]),
            ("b", &[EPSILON, "x"]),
            ("#", &["#"]),
        ]);
        let mut budget = MAX_ALIGNS_PER_ENTRY;
        let aligns = find_all_aligns(
            &strings(&["#", "x", "#"]),
            &strings(&["#", "a", "b", "#"]),
            &table,
            &mut budget,
        )
        .unwrap();
        assert_eq!(aligns.len(), 2);
        assert!(aligns.contains(&pairs(&[("#", "#"), ("x", "a"), (EPSILON, "b"), ("#", "#")])));
        assert!(aligns.contains(&pairs(&[("#", "#"), (EPSILON, "a"), ("x", "b"), ("#", "#")])));
    }

    #[test]
    fn enumerates_fused_paths() {
        let table = table_for(&[("x", &["g-z", "g"]), ("#", &["#"])]);
        let mut budget = MAX_ALIGNS_PER_ENTRY;
        let aligns = find_all_aligns(
            &strings(&["#", "g", "z", "#"]),
            &strings(&["#", "x", "#"]),
            &table,
            &mut budget,
        )
        .unwrap();
        assert_eq!(aligns, vec![pairs(&[("#", "#"), ("g-z", "x"), ("#", "#")])]);
    }

    #[test]
    fn alignment_shape_invariant() {
        let table = table_for(&[
            ("a", &["x", EPSILON]),
            ("b", &[EPSILON, "x"]),
            ("#", &["#"]),
        ]);
        let letters = strings(&["#", "a", "b", "#"]);
        let mut budget = MAX_ALIGNS_PER_ENTRY;
        for path in find_all_aligns(&strings(&["#", "x", "#"]), &letters, &table, &mut budget)
            .unwrap()
        {
            assert_eq!(path.len(), letters.len());
            assert_eq!(path[0], ("#".to_string(), "#".to_string()));
            assert_eq!(path[path.len() - 1], ("#".to_string(), "#".to_string()));
        }
    }

    #[test]
    fn cumulate_skips_boundaries_and_normalises() {
        let mut lexicon = Lexicon::default();
        lexicon.insert(
            "ab".into(),
            Heteronym {
                pos: "nil".into(),
                syllables: None,
                phones: strings(&["x"]),
            },
        );
        let allowables: Allowables = [
            ("a".to_string(), vec!["x".to_string(), EPSILON.to_string()]),
            ("b".to_string(), vec![EPSILON.to_string(), "x".to_string()]),
            ("#".to_string(), vec!["#".to_string()]),
        ]
        .into_iter()
        .collect();
        let mut table = CooccurrenceTable::new(&allowables);
        let failures = cumulate_pairs(&lexicon, &mut table);
        assert!(failures.is_empty());
        // Two paths: (x,a)+(eps,b) and (eps,a)+(x,b). Boundary pairs add 0.
        assert_eq!(table.score("#", "#"), 0.0);
        assert_eq!(table.score("x", "a"), 1.0);
        assert_eq!(table.score(EPSILON, "a"), 0.1);
        let norm = table.normalised();
        for (letter, row) in norm.rows() {
            let total: f64 = row.values().sum();
            if letter == "#" {
                assert_eq!(total, 0.0);
            } else {
                assert!((total - 1.0).abs() < 1e-9, "row {} sums to {}", letter, total);
            }
        }
    }

    #[test]
    fn tie_break_prefers_later_epsilons() {
        // Uniform scores make the two paths for "ab" tie. The epsilon index
        // sum is 2 for (x,a)(eps,b) and 1 for (eps,a)(x,b), so the trailing
        // silent letter wins.
        let table = table_for(&[
            ("a", &["x", EPSILON]),
            ("b", &[EPSILON, "x"]),
            ("#", &["#"]),
        ])
        .normalised();
        let best = find_best_alignment(
            &strings(&["#", "x", "#"]),
            &strings(&["#", "a", "b", "#"]),
            &table,
        )
        .unwrap();
        assert_eq!(best, pairs(&[("#", "#"), ("x", "a"), (EPSILON, "b"), ("#", "#")]));
    }

    #[test]
    fn best_alignment_maximises_score() {
        let allowables: Allowables = [
            ("a".to_string(), vec!["x".to_string(), EPSILON.to_string()]),
            ("b".to_string(), vec![EPSILON.to_string(), "x".to_string()]),
            ("#".to_string(), vec!["#".to_string()]),
        ]
        .into_iter()
        .collect();
        let mut table = CooccurrenceTable::new(&allowables);
        // Skew the counts so (eps,a)+(x,b) scores higher.
        for _ in 0..10 {
            table.cumulate("x", "b");
            table.cumulate(EPSILON, "a");
        }
        table.cumulate("x", "a");
        table.cumulate(EPSILON, "b");
        let norm = table.normalised();
        let best = find_best_alignment(
            &strings(&["#", "x", "#"]),
            &strings(&["#", "a", "b", "#"]),
            &norm,
        )
        .unwrap();
        assert_eq!(best, pairs(&[("#", "#"), (EPSILON, "a"), ("x", "b"), ("#", "#")]));
    }

    #[test]
    fn unalignable_entries_are_collected_not_fatal() {
        let mut lexicon = Lexicon::default();
        lexicon.insert(
            "ab".into(),
            Heteronym {
                pos: "nil".into(),
                syllables: None,
                phones: strings(&["q", "q", "q"]),
            },
        );
        let allowables: Allowables = [
            ("a".to_string(), vec!["x".to_string()]),
            ("b".to_string(), vec!["x".to_string()]),
            ("#".to_string(), vec!["#".to_string()]),
        ]
        .into_iter()
        .collect();
        let mut table = CooccurrenceTable::new(&allowables);
        let failures = cumulate_pairs(&lexicon, &mut table);
        assert_eq!(
            failures,
            vec![AlignFailure {
                word: "ab".into(),
                phones: "q q q".into()
            }]
        );
    }

    #[test]
    fn align_file_round_trip() {
        let entries = vec![AlignedEntry {
            pos: "nil".into(),
            path: pairs(&[("#", "#"), ("x", "a"), (EPSILON, "b"), ("#", "#")]),
        }];
        let mut buf = Vec::new();
        save_lex_align(&entries, &mut buf).unwrap();
        assert_eq!(
            String::from_utf8(buf.clone()).unwrap(),
            "( ( a b ) nil x _epsilon_ )\n"
        );
        let records = read_align(Cursor::new(buf)).unwrap();
        assert_eq!(
            records,
            vec![AlignRecord {
                letters: strings(&["a", "b"]),
                pos: "nil".into(),
                phones: strings(&["x", EPSILON]),
            }]
        );
    }
}
