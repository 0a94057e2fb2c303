//! The per-letter decision trees. The external learner hands these back as
//! S-expressions: an internal node is a three element list of a `(feat is
//! value)` condition and two subtrees, a leaf is a single element list of
//! weighted phones ending in the winning phone.
//!
//! ```text
//! ((n.name is c)
//!  ((x 1) x)
//!  ((y 2) y)
//! )
//! ```
//!
//! The trees are simplified in memory (zero weight phones dropped), merged
//! into one rules file keyed by letter and later lowered to a state machine.
use crate::error::LtsError;
use crate::progress::progress_bar;
use crate::sexpr::{self, Value};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub enum Tree {
    Node {
        feat: String,
        value: String,
        yes: Box<Tree>,
        no: Box<Tree>,
    },
    Leaf {
        /// Phones with their training weights, kept only for the rules file.
        weights: Vec<(String, f64)>,
        /// The majority phone this leaf predicts.
        phone: String,
    },
}

/// The merged model: one tree per letter, ordered by letter.
pub type RuleSet = Vec<(String, Tree)>;

/// Maps a positional feature name to its offset from the central letter. The
/// four-away offsets never appear in trained trees (the trainer marks them
/// `ignore`) but are legal tests.
pub fn feat_offset(feat: &str) -> Result<isize, LtsError> {
    match feat {
        "name" => Ok(0),
        "n.name" => Ok(1),
        "n.n.name" => Ok(2),
        "n.n.n.name" => Ok(3),
        "n.n.n.n.name" => Ok(4),
        "p.name" => Ok(-1),
        "p.p.name" => Ok(-2),
        "p.p.p.name" => Ok(-3),
        "p.p.p.p.name" => Ok(-4),
        other => Err(LtsError::UnknownFeature(other.to_string())),
    }
}

impl Tree {
    pub fn from_value(value: &Value) -> anyhow::Result<Self> {
        let items = value
            .as_list()
            .ok_or_else(|| LtsError::MalformedInput(format!("tree is not a list: {}", value)))?;
        if let Some(condition) = node_condition(items) {
            let feat = condition[0]
                .atom_text()
                .ok_or_else(|| LtsError::MalformedInput(format!("bad condition: {}", value)))?;
            let test_value = condition[2]
                .atom_text()
                .ok_or_else(|| LtsError::MalformedInput(format!("bad condition: {}", value)))?;
            Ok(Tree::Node {
                feat,
                value: test_value,
                yes: Box::new(Tree::from_value(&items[1])?),
                no: Box::new(Tree::from_value(&items[2])?),
            })
        } else if items.len() == 1 {
            let members = items[0].as_list().ok_or_else(|| {
                LtsError::MalformedInput(format!("leaf is not a list: {}", value))
            })?;
            let (phone, weighted) = members.split_last().ok_or_else(|| {
                LtsError::MalformedInput(format!("empty leaf: {}", value))
            })?;
            let phone = phone
                .atom_text()
                .ok_or_else(|| LtsError::MalformedInput(format!("bad leaf phone: {}", value)))?;
            let weights = weighted
                .iter()
                .map(|pair| {
                    let pair = pair.as_list().filter(|p| p.len() == 2).ok_or_else(|| {
                        LtsError::MalformedInput(format!("bad leaf weight: {}", value))
                    })?;
                    let phone = pair[0].atom_text().ok_or_else(|| {
                        LtsError::MalformedInput(format!("bad leaf weight: {}", value))
                    })?;
                    let weight = pair[1].as_f64().ok_or_else(|| {
                        LtsError::MalformedInput(format!("bad leaf weight: {}", value))
                    })?;
                    Ok((phone, weight))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(Tree::Leaf { weights, phone })
        } else {
            Err(LtsError::MalformedInput(format!("unexpected tree shape: {}", value)).into())
        }
    }

    /// Drops the learner's zero weight bookkeeping entries from every leaf.
    pub fn simplify(self) -> Self {
        match self {
            Tree::Node {
                feat,
                value,
                yes,
                no,
            } => Tree::Node {
                feat,
                value,
                yes: Box::new(yes.simplify()),
                no: Box::new(no.simplify()),
            },
            Tree::Leaf { weights, phone } => Tree::Leaf {
                weights: weights.into_iter().filter(|(_, w)| *w != 0.0).collect(),
                phone,
            },
        }
    }

    /// Evaluates the tree for `word[index]` where `word` is the padded letter
    /// list `0 0 # l1 ... ln # 0 0`. Out of range tests never match.
    pub fn predict<'a>(&'a self, word: &[String], index: usize) -> Result<&'a str, LtsError> {
        match self {
            Tree::Node {
                feat,
                value,
                yes,
                no,
            } => {
                let offset = feat_offset(feat)?;
                let position = index as isize + offset;
                let matches = position >= 0
                    && word
                        .get(position as usize)
                        .map_or(false, |letter| letter == value);
                if matches {
                    yes.predict(word, index)
                } else {
                    no.predict(word, index)
                }
            }
            Tree::Leaf { phone, .. } => Ok(phone),
        }
    }

    /// Serializes one tree in the indented rules file layout.
    pub fn write(&self, writer: &mut impl Write, indent: usize) -> io::Result<()> {
        match self {
            Tree::Node {
                feat,
                value,
                yes,
                no,
            } => {
                writeln!(writer, "{:indent$}(({} is {})", "", feat, value)?;
                yes.write(writer, indent + 1)?;
                no.write(writer, indent + 1)?;
                writeln!(writer, "{:indent$})", "")
            }
            Tree::Leaf { weights, phone } => {
                let pairs: Vec<String> = weights
                    .iter()
                    .map(|(p, w)| format!("({} {})", p, format_weight(*w)))
                    .collect();
                writeln!(writer, "{:indent$}(({} {}))", "", pairs.join(" "), phone)
            }
        }
    }
}

fn node_condition(items: &[Value]) -> Option<&[Value]> {
    if items.len() != 3 {
        return None;
    }
    items[0]
        .as_list()
        .filter(|c| c.len() == 3 && c[1].text() == Some("is"))
}

fn format_weight(weight: f64) -> String {
    if weight.fract() == 0.0 && weight.is_finite() {
        format!("{}", weight as i64)
    } else {
        format!("{}", weight)
    }
}

/// Reads a learner output file, dropping `;` comment lines.
pub fn read_tree(path: impl AsRef<Path>) -> anyhow::Result<Tree> {
    let text = fs::read_to_string(path.as_ref())?;
    let body: Vec<&str> = text.lines().filter(|l| !l.starts_with(';')).collect();
    let value = sexpr::parse(&body.join(" "))?;
    Tree::from_value(&value)
}

/// Collects the per-letter tree files from the scratch directory into one
/// simplified rule set.
pub fn merge_models(letters: &[String], scratch_dir: &Path) -> anyhow::Result<RuleSet> {
    let mut rules = vec![];
    for (i, letter) in letters.iter().enumerate() {
        progress_bar(i, letters.len());
        let tree = read_tree(scratch_dir.join(format!("lts.{}.tree", letter)))?;
        rules.push((letter.clone(), tree.simplify()));
    }
    Ok(rules)
}

/// Writes the combined rules file, `(set! NAME '((letter tree) ...))`.
pub fn write_rules(name: &str, rules: &RuleSet, writer: &mut impl Write) -> io::Result<()> {
    writeln!(writer, ";; LTS rules")?;
    writeln!(writer, "(set! {} '(", name)?;
    for (letter, tree) in rules {
        writeln!(writer, "({}", letter)?;
        tree.write(writer, 1)?;
        writeln!(writer, ")")?;
    }
    writeln!(writer, "))")
}

pub fn save_rules(name: &str, rules: &RuleSet, path: impl AsRef<Path>) -> anyhow::Result<()> {
    let mut writer = io::BufWriter::new(fs::File::create(path.as_ref())?);
    write_rules(name, rules, &mut writer)?;
    Ok(())
}

/// Reads a rules file back. Comment lines are dropped and the `(set! ... '`
/// wrapper is peeled off before parsing so the body must be a well formed
/// list of `(letter tree)` pairs.
pub fn read_rules(text: &str) -> anyhow::Result<RuleSet> {
    let body: Vec<&str> = text.lines().filter(|l| !l.starts_with(';')).collect();
    let body = body.join(" ");
    let start = body.find('\'').ok_or_else(|| {
        LtsError::MalformedInput("rules file has no quoted rules list".into())
    })?;
    let body = body[start + 1..].trim_end();
    let body = body.strip_suffix(')').ok_or_else(|| {
        LtsError::MalformedInput("rules file is not closed".into())
    })?;
    let value = sexpr::parse(body)?;
    let items = value
        .as_list()
        .ok_or_else(|| LtsError::MalformedInput("rules body is not a list".into()))?;
    let mut rules = vec![];
    for item in items {
        let pair = item
            .as_list()
            .filter(|p| p.len() == 2)
            .ok_or_else(|| LtsError::MalformedInput(format!("bad rules entry: {}", item)))?;
        let letter = pair[0]
            .atom_text()
            .ok_or_else(|| LtsError::MalformedInput(format!("bad rules letter: {}", item)))?;
        rules.push((letter, Tree::from_value(&pair[1])?));
    }
    Ok(rules)
}

pub fn load_rules(path: impl AsRef<Path>) -> anyhow::Result<RuleSet> {
    read_rules(&fs::read_to_string(path.as_ref())?)
}
