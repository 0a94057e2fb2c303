//! Festival format lexicon loading. The lexicon is a text file with one entry
//! per line, each a three element list: the quoted word, an optional part of
//! speech and the transcription. The transcription is either syllabified,
//! `((phones) stress)` groups, or already flat. A word may appear on several
//! lines when it has heteronyms.
//!
//! ```text
//! ("hello" nil (((hh ax) 0) ((l ow) 1)))
//! ```
//!
//! Only a fraction of a real lexicon is useful for rules training - short
//! words, abbreviations and words with out-of-alphabet characters teach the
//! trees the wrong things - so a filtering pass runs before alignment.
use crate::align::Allowables;
use crate::error::LtsError;
use crate::sexpr::{self, Value};
use anyhow::Context;
use std::collections::{btree_map, BTreeMap};
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;
use unicode_segmentation::UnicodeSegmentation;

/// Splits a word into the letters the aligner and the trees operate on.
pub fn word_letters(word: &str) -> Vec<String> {
    word.graphemes(true).map(str::to_string).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Syllable {
    pub phones: Vec<String>,
    pub stress: i64,
}

/// One pronunciation of a word. `syllables` is only present when the source
/// lexicon carried syllable structure, `phones` is always the flat sequence
/// the rest of the pipeline consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct Heteronym {
    pub pos: String,
    pub syllables: Option<Vec<Syllable>>,
    pub phones: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct Lexicon {
    entries: BTreeMap<String, Vec<Heteronym>>,
}

/// Predicates applied by [`Lexicon::filter`].
#[derive(Debug, Clone, Default)]
pub struct FilterOptions<'a> {
    /// Words shorter than this many letters are dropped.
    pub min_length: usize,
    /// Lowercase surviving words.
    pub lowercase: bool,
    /// Drop words containing a letter the allowables table has no entry for.
    pub remove_invalid_letters: bool,
    pub allowables: Option<&'a Allowables>,
}

impl Lexicon {
    /// Opens a lexicon file. `flat` selects the flat transcription format;
    /// otherwise syllables are flattened, appending the stress digit to any
    /// phone named in `stress_vowels`.
    pub fn open(path: impl AsRef<Path>, flat: bool, stress_vowels: &[String]) -> anyhow::Result<Self> {
        let file = fs::File::open(path.as_ref())
            .with_context(|| format!("opening lexicon {}", path.as_ref().display()))?;
        Self::from_reader(io::BufReader::new(file), flat, stress_vowels)
    }

    pub fn from_reader(
        reader: impl BufRead,
        flat: bool,
        stress_vowels: &[String],
    ) -> anyhow::Result<Self> {
        let mut lexicon = Self::default();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || (i == 0 && trimmed == "MNCL") {
                continue;
            }
            let (word, heteronym) = parse_entry(trimmed, flat, stress_vowels)
                .with_context(|| format!("malformed lexicon line {}: {}", i + 1, trimmed))?;
            lexicon.insert(word, heteronym);
        }
        Ok(lexicon)
    }

    pub fn insert(&mut self, word: String, heteronym: Heteronym) {
        self.entries.entry(word).or_default().push(heteronym);
    }

    /// Number of distinct words.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, word: &str) -> Option<&Vec<Heteronym>> {
        self.entries.get(word)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Vec<Heteronym>> {
        self.entries.iter()
    }

    /// Applies the training filter. Length is tested on the unmodified word;
    /// when two words collapse onto the same filtered form the later one
    /// replaces the earlier.
    pub fn filter(&self, opts: &FilterOptions) -> Result<Lexicon, LtsError> {
        if opts.remove_invalid_letters && opts.allowables.is_none() {
            return Err(LtsError::MissingAllowables);
        }
        let mut filtered = Lexicon::default();
        for (word, heteronyms) in &self.entries {
            if word_letters(word).len() < opts.min_length {
                continue;
            }
            let mut word_filtered = word.clone();
            if opts.lowercase {
                word_filtered = word_filtered.to_lowercase();
            }
            if opts.remove_invalid_letters {
                word_filtered = word_filtered.to_lowercase();
                let table = opts.allowables.expect("checked above");
                if word_letters(&word_filtered)
                    .iter()
                    .any(|letter| !table.contains_letter(letter))
                {
                    continue;
                }
            }
            filtered.entries.insert(word_filtered, heteronyms.clone());
        }
        Ok(filtered)
    }

    /// Writes the lexicon back out in festival format with flat phones.
    pub fn write(&self, writer: &mut impl Write) -> io::Result<()> {
        for (word, heteronyms) in &self.entries {
            for heteronym in heteronyms {
                writeln!(
                    writer,
                    "( \"{}\" {} ({} ))",
                    word,
                    heteronym.pos,
                    heteronym.phones.join(" ")
                )?;
            }
        }
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let mut writer = io::BufWriter::new(fs::File::create(path.as_ref())?);
        self.write(&mut writer)?;
        Ok(())
    }
}

fn parse_entry(
    line: &str,
    flat: bool,
    stress_vowels: &[String],
) -> anyhow::Result<(String, Heteronym)> {
    let parsed = sexpr::parse(line)?;
    let items = parsed
        .as_list()
        .filter(|items| items.len() == 3)
        .ok_or_else(|| LtsError::MalformedInput("entry is not a three element list".into()))?;
    let word = items[0]
        .text()
        .ok_or_else(|| LtsError::MalformedInput("entry word is not an atom".into()))?
        .to_string();
    let pos = items[1]
        .atom_text()
        .ok_or_else(|| LtsError::MalformedInput("entry pos is not an atom".into()))?;
    let body = items[2]
        .as_list()
        .ok_or_else(|| LtsError::MalformedInput("entry body is not a list".into()))?;
    let heteronym = if flat {
        Heteronym {
            pos,
            syllables: None,
            phones: atoms(body)?,
        }
    } else {
        let syllables = body
            .iter()
            .map(parse_syllable)
            .collect::<anyhow::Result<Vec<_>>>()?;
        let phones = flatten_syllables(&syllables, stress_vowels);
        Heteronym {
            pos,
            syllables: Some(syllables),
            phones,
        }
    };
    Ok((word, heteronym))
}

fn parse_syllable(value: &Value) -> anyhow::Result<Syllable> {
    let items = value
        .as_list()
        .filter(|items| items.len() == 2)
        .ok_or_else(|| LtsError::MalformedInput(format!("unexpected syllable: {}", value)))?;
    let phones = items[0]
        .as_list()
        .ok_or_else(|| LtsError::MalformedInput(format!("unexpected syllable: {}", value)))?;
    let stress = items[1]
        .as_i64()
        .ok_or_else(|| LtsError::MalformedInput(format!("unexpected syllable: {}", value)))?;
    Ok(Syllable {
        phones: atoms(phones)?,
        stress,
    })
}

fn atoms(values: &[Value]) -> anyhow::Result<Vec<String>> {
    values
        .iter()
        .map(|v| {
            v.atom_text()
                .ok_or_else(|| LtsError::MalformedInput(format!("expected an atom, got {}", v)).into())
        })
        .collect()
}

/// Concatenates syllable phones, marking vowels with their syllable's stress
/// digit.
fn flatten_syllables(syllables: &[Syllable], stress_vowels: &[String]) -> Vec<String> {
    let mut output = vec![];
    for syllable in syllables {
        for phone in &syllable.phones {
            if stress_vowels.iter().any(|v| v == phone) {
                output.push(format!("{}{}", phone, syllable.stress));
            } else {
                output.push(phone.clone());
            }
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn reads_syllabified_entries() {
        let cursor = Cursor::new(
            "MNCL\n(\"hello\" nil (((hh ax) 0) ((l ow) 1)))\n\n(\"hello\" v (((hh eh) 1) ((l ow) 0)))",
        );
        let lexicon = Lexicon::from_reader(cursor, false, &strings(&["ax", "ow", "eh"])).unwrap();
        assert_eq!(lexicon.len(), 1);
        let heteronyms = lexicon.get("hello").unwrap();
        assert_eq!(heteronyms.len(), 2);
        assert_eq!(heteronyms[0].phones, strings(&["hh", "ax0", "l", "ow1"]));
        assert_eq!(heteronyms[1].pos, "v");
        assert_eq!(heteronyms[1].phones, strings(&["hh", "eh1", "l", "ow0"]));
        assert_eq!(
            heteronyms[0].syllables.as_ref().unwrap()[0],
            Syllable {
                phones: strings(&["hh", "ax"]),
                stress: 0
            }
        );
    }

    #[test]
    fn reads_flat_entries() {
        let cursor = Cursor::new("(\"abet\" nil (ax0 b eh1 t))");
        let lexicon = Lexicon::from_reader(cursor, true, &[]).unwrap();
        let heteronyms = lexicon.get("abet").unwrap();
        assert_eq!(heteronyms[0].phones, strings(&["ax0", "b", "eh1", "t"]));
        assert!(heteronyms[0].syllables.is_none());
    }

    #[test]
    fn malformed_entry_is_fatal() {
        let cursor = Cursor::new("(\"word\" nil");
        assert!(Lexicon::from_reader(cursor, true, &[]).is_err());
        let cursor = Cursor::new("(\"word\")");
        assert!(Lexicon::from_reader(cursor, true, &[]).is_err());
    }

    #[test]
    fn filter_drops_short_words_and_lowercases() {
        let allowables: Allowables = ('a'..='z')
            .map(|c| (c.to_string(), vec!["x".to_string()]))
            .chain([("#".to_string(), vec!["#".to_string()])])
            .collect();
        let mut lexicon = Lexicon::default();
        for word in ["ab", "hello", "WORLD"] {
            lexicon.insert(
                word.into(),
                Heteronym {
                    pos: "nil".into(),
                    syllables: None,
                    phones: strings(&["x"]),
                },
            );
        }
        let filtered = lexicon
            .filter(&FilterOptions {
                min_length: 4,
                lowercase: true,
                remove_invalid_letters: true,
                allowables: Some(&allowables),
            })
            .unwrap();
        let words: Vec<&String> = filtered.iter().map(|(w, _)| w).collect();
        assert_eq!(words, vec!["hello", "world"]);
    }

    #[test]
    fn filter_drops_out_of_alphabet_words() {
        let allowables: Allowables = [
            ("a".to_string(), vec!["x".to_string()]),
            ("b".to_string(), vec!["x".to_string()]),
            ("#".to_string(), vec!["#".to_string()]),
        ]
        .into_iter()
        .collect();
        let mut lexicon = Lexicon::default();
        for word in ["abba", "ab2a"] {
            lexicon.insert(
                word.into(),
                Heteronym {
                    pos: "nil".into(),
                    syllables: None,
                    phones: strings(&["x"]),
                },
            );
        }
        let filtered = lexicon
            .filter(&FilterOptions {
                min_length: 4,
                lowercase: true,
                remove_invalid_letters: true,
                allowables: Some(&allowables),
            })
            .unwrap();
        assert!(filtered.get("abba").is_some());
        assert!(filtered.get("ab2a").is_none());
    }

    #[test]
    fn filter_without_allowables_is_an_error() {
        let lexicon = Lexicon::default();
        let err = lexicon
            .filter(&FilterOptions {
                min_length: 4,
                lowercase: true,
                remove_invalid_letters: true,
                allowables: None,
            })
            .unwrap_err();
        assert!(matches!(err, LtsError::MissingAllowables));
    }

    #[test]
    fn write_round_trips_flat_entries() {
        let mut lexicon = Lexicon::default();
        lexicon.insert(
            "abet".into(),
            Heteronym {
                pos: "nil".into(),
                syllables: None,
                phones: strings(&["ax0", "b", "eh1", "t"]),
            },
        );
        let mut buf = Vec::new();
        lexicon.write(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "( \"abet\" nil (ax0 b eh1 t ))\n");
        let reread = Lexicon::from_reader(Cursor::new(text), true, &[]).unwrap();
        assert_eq!(reread.get("abet"), lexicon.get("abet"));
    }
}
