//! Packs the per-letter WFSTs into the C tables the synthesizer's runtime
//! links against. Three artifacts land in one generated source file:
//!
//! 1. the rule array - one 8 byte record per WFST state, feature and value
//!    packed into a single word, with forward jump targets,
//! 2. the phone table the terminal rules index into,
//! 3. a sparse nested index from the UTF-8 bytes of a letter to the letter's
//!    first rule.
//!
//! The index fanout widths (128 ASCII entries, then 32/16/8 lead-byte and 64
//! continuation-byte entries) match what the consuming C runtime expects and
//! must not change.
use crate::error::LtsError;
use crate::progress::progress_bar;
use crate::sexpr::{self, Value};
use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// One rule of the packed model. Terminal rules use feat 255, their val is a
/// phone table index and both jumps are -1; condition rules store the letter
/// code point in val and jump by rule index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedRule {
    pub feat: u32,
    pub val: u32,
    pub qtrue: i64,
    pub qfalse: i64,
}

/// The value field is 21 bits, the feature 8. Anything wider corrupts the
/// packed word.
const VAL_MASK: u32 = 0x001F_FFFF;

impl PackedRule {
    /// The packed `featval` word, checked against the field widths.
    pub fn featval(&self) -> Result<u32, LtsError> {
        if self.val > VAL_MASK || self.feat > 0xFF {
            return Err(LtsError::RuleOverflow {
                feat: self.feat,
                val: self.val,
            });
        }
        Ok((self.val & VAL_MASK) | ((self.feat & 0xFF) << 24))
    }
}

/// The first arc of a condition state carries the negated test, so this is
/// what the label parser sees.
static NOT_CONDITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^_not_(?P<feat>[^_]+)_is_(?P<letter>.+)_$").unwrap());

/// The feature numbering baked into the runtime: window positions left to
/// right, with the central letter absent (its tree is already selected by the
/// letter).
fn feat_index(feat: &str) -> Result<u32, LtsError> {
    match feat {
        "p.p.p.p.name" => Ok(0),
        "p.p.p.name" => Ok(1),
        "p.p.name" => Ok(2),
        "p.name" => Ok(3),
        "n.name" => Ok(4),
        "n.n.name" => Ok(5),
        "n.n.n.name" => Ok(6),
        "n.n.n.n.name" => Ok(7),
        other => Err(LtsError::UnknownFeature(other.to_string())),
    }
}

fn intern(phone_table: &mut Vec<String>, phone: &str) -> usize {
    match phone_table.iter().position(|p| p == phone) {
        Some(i) => i,
        None => {
            phone_table.push(phone.to_string());
            phone_table.len() - 1
        }
    }
}

fn bad_wfst(detail: impl Into<String>) -> LtsError {
    LtsError::MalformedInput(format!("bad WFST record: {}", detail.into()))
}

/// Parses one letter's WFST file body into packed rules. `start_index` is the
/// global rule index of this letter's first state; the updated index is
/// returned for the next letter. Jump targets arrive as tree numbers and are
/// remapped to rule indices before returning, `final` records consume no rule
/// slot.
fn parse_wfst(
    text: &str,
    start_index: i64,
    phone_table: &mut Vec<String>,
) -> anyhow::Result<(i64, Vec<PackedRule>)> {
    let mut body = vec![];
    let mut in_header = true;
    for line in text.lines() {
        if !in_header {
            body.push(line);
        }
        if line.starts_with("EST_Header_End") {
            in_header = false;
        }
    }
    if in_header {
        return Err(bad_wfst("no EST_Header_End line").into());
    }
    let parsed = sexpr::parse(&format!("( {} )", body.join(" ")))?;
    let records = parsed.as_list().ok_or_else(|| bad_wfst("body"))?;

    struct RawRule {
        feat: u32,
        val: u32,
        qtrue: Option<i64>,
        qfalse: Option<i64>,
    }
    let mut state_index = start_index;
    let mut tree_to_state: BTreeMap<i64, i64> = BTreeMap::new();
    let mut raw_rules = vec![];
    for record in records {
        let items = record.as_list().ok_or_else(|| bad_wfst("record"))?;
        let head = items
            .first()
            .and_then(Value::as_list)
            .filter(|h| h.len() == 3)
            .ok_or_else(|| bad_wfst("record head"))?;
        let tree_num = head[0].as_i64().ok_or_else(|| bad_wfst("tree number"))?;
        let marker = head[1].text().ok_or_else(|| bad_wfst("final marker"))?;
        let num_leafs = head[2].as_i64().ok_or_else(|| bad_wfst("leaf count"))?;
        tree_to_state.insert(tree_num, state_index);
        if marker == "final" {
            // Final states all collapse onto the next emitted rule.
            state_index -= 1;
        } else {
            let first = items
                .get(1)
                .and_then(Value::as_list)
                .ok_or_else(|| bad_wfst("first arc"))?;
            let label = first
                .first()
                .and_then(Value::atom_text)
                .ok_or_else(|| bad_wfst("arc label"))?;
            if num_leafs > 0 && label.contains('_') {
                let caps = NOT_CONDITION
                    .captures(&label)
                    .ok_or_else(|| bad_wfst(format!("condition label {}", label)))?;
                let feat = feat_index(&caps["feat"])?;
                let letter = caps["letter"]
                    .chars()
                    .last()
                    .ok_or_else(|| bad_wfst(format!("condition label {}", label)))?;
                let qfalse = first
                    .get(2)
                    .and_then(Value::as_i64)
                    .ok_or_else(|| bad_wfst("false target"))?;
                let qtrue = items
                    .get(2)
                    .and_then(Value::as_list)
                    .and_then(|arc| arc.get(2))
                    .and_then(Value::as_i64)
                    .ok_or_else(|| bad_wfst("true target"))?;
                raw_rules.push(RawRule {
                    feat,
                    val: letter as u32,
                    qtrue: Some(qtrue),
                    qfalse: Some(qfalse),
                });
            } else {
                let phone_idx = intern(phone_table, &label);
                raw_rules.push(RawRule {
                    feat: 255,
                    val: phone_idx as u32,
                    qtrue: None,
                    qfalse: None,
                });
            }
        }
        state_index += 1;
    }
    let mut rules = vec![];
    for raw in raw_rules {
        let resolve = |target: Option<i64>| -> anyhow::Result<i64> {
            match target {
                None => Ok(-1),
                Some(tree_num) => tree_to_state
                    .get(&tree_num)
                    .copied()
                    .ok_or_else(|| bad_wfst(format!("jump to unknown tree {}", tree_num)).into()),
            }
        };
        rules.push(PackedRule {
            feat: raw.feat,
            val: raw.val,
            qtrue: resolve(raw.qtrue)?,
            qfalse: resolve(raw.qfalse)?,
        });
    }
    Ok((state_index, rules))
}

/// Parses every letter's WFST in order, assigning global rule indices.
/// Returns the rules, each letter's start index and the interned phone table
/// (position 0 is always `epsilon`).
pub fn extract_models(
    letters: &[String],
    wfst_dir: &Path,
) -> anyhow::Result<(Vec<PackedRule>, BTreeMap<String, i64>, Vec<String>)> {
    let mut phone_table = vec!["epsilon".to_string()];
    let mut rule_index = BTreeMap::new();
    let mut models = vec![];
    let mut start_index = 0i64;
    for (i, letter) in letters.iter().enumerate() {
        progress_bar(i, letters.len());
        let path = wfst_dir.join(format!("{}.tree.wfst", letter));
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading WFST {}", path.display()))?;
        rule_index.insert(letter.clone(), start_index);
        let (next_index, rules) = parse_wfst(&text, start_index, &mut phone_table)?;
        models.extend(rules);
        start_index = next_index;
    }
    Ok((models, rule_index, phone_table))
}

fn c_file_header(includes: &[&str], prefix: &str) -> Vec<String> {
    let mut lines = vec![
        "/*******************************************************/".to_string(),
        format!(
            "/**  Autogenerated lts rules (regex) for lexicon {}     */",
            prefix
        ),
        "/*******************************************************/".to_string(),
        String::new(),
    ];
    lines.extend(includes.iter().map(|h| format!("#include \"{}\"", h)));
    lines
}

fn model_rules_lines(models: &[PackedRule], prefix: &str) -> Result<Vec<String>, LtsError> {
    let mut lines = vec![
        format!(
            "const cst_lts_rule {}_lts_model[{}] = ",
            prefix,
            models.len() + 1
        ),
        "{".to_string(),
    ];
    let structs = models
        .iter()
        .map(|rule| {
            Ok(format!(
                "{{{}, {}, {}}}",
                rule.featval()?,
                rule.qtrue,
                rule.qfalse
            ))
        })
        .collect::<Result<Vec<_>, LtsError>>()?;
    lines.push(format!("  {},", structs.join(",\n  ")));
    // The terminating zero record the runtime stops on.
    lines.push("  {0, 0, 0}".to_string());
    lines.push("};".to_string());
    lines.push(String::new());
    Ok(lines)
}

fn phone_table_lines(phone_table: &[String], prefix: &str) -> Vec<String> {
    let mut lines = vec![
        String::new(),
        format!(
            "const char * const {}_lts_phone_table[{}] = ",
            prefix,
            phone_table.len() + 1
        ),
        "{".to_string(),
    ];
    for phone in phone_table {
        lines.push(format!("    \"{}\",", phone));
    }
    lines.push("    NULL".to_string());
    lines.push("};".to_string());
    lines
}

/// Renders one fixed width C array with `missing` in the unset slots.
fn c_vec(
    vartype: &str,
    varname: &str,
    length: usize,
    entries: &BTreeMap<u8, String>,
    missing: &str,
) -> String {
    let mut values = vec![missing.to_string(); length];
    for (position, value) in entries {
        values[*position as usize] = value.clone();
    }
    format!(
        "{} {}[{}] = {{{}}};",
        vartype,
        varname,
        length,
        values.join(", ")
    )
}

type Plane1 = BTreeMap<u8, String>;
type Plane2 = BTreeMap<u8, Plane1>;
type Plane3 = BTreeMap<u8, Plane2>;
type Plane4 = BTreeMap<u8, Plane3>;

/// Builds the UTF-8 dispatch index arrays and the closing
/// `map_unicode_to_int` aggregate. Letters are keyed by their encoded bytes,
/// offset so each level's array starts at zero: lead bytes lose their prefix
/// bits (192/224/240 for 2/3/4 byte encodings), continuation bytes lose 128.
fn letter_index_lines(
    letters: &[String],
    rule_index: &BTreeMap<String, i64>,
    prefix: &str,
) -> anyhow::Result<Vec<String>> {
    let mut p1 = Plane1::new();
    let mut p2 = Plane2::new();
    let mut p3 = Plane3::new();
    let mut p4 = Plane4::new();
    for letter in letters {
        let index = rule_index[letter].to_string();
        let mut chars = letter.chars();
        let ch = match (chars.next(), chars.next()) {
            (Some(ch), None) => ch,
            _ => {
                return Err(LtsError::MalformedInput(format!(
                    "letter {:?} is not a single character, cannot index it",
                    letter
                ))
                .into())
            }
        };
        let mut buf = [0u8; 4];
        let bytes = ch.encode_utf8(&mut buf).as_bytes();
        match *bytes {
            [b0] => {
                p1.insert(b0, index);
            }
            [b0, b1] => {
                p2.entry(b0 - 192).or_default().insert(b1 - 128, index);
            }
            [b0, b1, b2] => {
                p3.entry(b0 - 224)
                    .or_default()
                    .entry(b1 - 128)
                    .or_default()
                    .insert(b2 - 128, index);
            }
            [b0, b1, b2, b3] => {
                p4.entry(b0 - 240)
                    .or_default()
                    .entry(b1 - 128)
                    .or_default()
                    .entry(b2 - 128)
                    .or_default()
                    .insert(b3 - 128, index);
            }
            _ => unreachable!("chars encode to 1-4 bytes"),
        }
    }

    let vecdef = format!("{}_lts_letter_index_v", prefix);
    let mut lines = vec![];
    let mut fields = [
        "NULL".to_string(),
        "NULL".to_string(),
        "NULL".to_string(),
        "NULL".to_string(),
        // Not-found sentinel and freeable flag.
        "-1".to_string(),
        "0".to_string(),
    ];
    if !p1.is_empty() {
        let name = format!("{}1", vecdef);
        lines.push(c_vec("const int32_t", &name, 128, &p1, "0"));
        fields[0] = format!("(int32_t *) {}", name);
    }
    if !p2.is_empty() {
        let mut pointers = Plane1::new();
        for (k1, leaves) in &p2 {
            let name = format!("{}2_{}", vecdef, k1);
            lines.push(c_vec("const int32_t", &name, 64, leaves, "0"));
            pointers.insert(*k1, name);
        }
        let name = format!("{}2", vecdef);
        lines.push(c_vec("const int32_t *", &name, 32, &pointers, "NULL"));
        fields[1] = format!("(int32_t **) {}", name);
    }
    if !p3.is_empty() {
        let mut top = Plane1::new();
        for (k1, mids) in &p3 {
            let mut mid_pointers = Plane1::new();
            for (k2, leaves) in mids {
                let name = format!("{}3_{}_{}", vecdef, k1, k2);
                lines.push(c_vec("const int32_t", &name, 64, leaves, "0"));
                mid_pointers.insert(*k2, name);
            }
            let name = format!("{}3_{}", vecdef, k1);
            lines.push(c_vec("const int32_t *", &name, 64, &mid_pointers, "NULL"));
            top.insert(*k1, name);
        }
        let name = format!("{}3", vecdef);
        lines.push(c_vec("const int32_t **", &name, 16, &top, "NULL"));
        fields[2] = format!("(int32_t ***) {}", name);
    }
    if !p4.is_empty() {
        let mut top = Plane1::new();
        for (k1, level2) in &p4 {
            let mut l2_pointers = Plane1::new();
            for (k2, level3) in level2 {
                let mut l3_pointers = Plane1::new();
                for (k3, leaves) in level3 {
                    let name = format!("{}4_{}_{}_{}", vecdef, k1, k2, k3);
                    lines.push(c_vec("const int32_t", &name, 64, leaves, "0"));
                    l3_pointers.insert(*k3, name);
                }
                let name = format!("{}4_{}_{}", vecdef, k1, k2);
                lines.push(c_vec("const int32_t *", &name, 64, &l3_pointers, "NULL"));
                l2_pointers.insert(*k2, name);
            }
            let name = format!("{}4_{}", vecdef, k1);
            lines.push(c_vec("const int32_t **", &name, 64, &l2_pointers, "NULL"));
            top.insert(*k1, name);
        }
        let name = format!("{}4", vecdef);
        lines.push(c_vec("const int32_t ***", &name, 8, &top, "NULL"));
        fields[3] = format!("(int32_t ****) {}", name);
    }
    lines.push(String::new());
    lines.push(format!(
        "const map_unicode_to_int {}_lts_letter_index = {{",
        prefix
    ));
    lines.push(format!("{}}};", fields.join(", ")));
    Ok(lines)
}

/// Renders the complete generated C source.
pub fn render_c(
    prefix: &str,
    letters: &[String],
    models: &[PackedRule],
    rule_index: &BTreeMap<String, i64>,
    phone_table: &[String],
) -> anyhow::Result<String> {
    let mut lines = c_file_header(&["cst_string.h", "cst_lts.h", "cst_lexicon.h"], prefix);
    lines.extend(model_rules_lines(models, prefix)?);
    lines.extend(phone_table_lines(phone_table, prefix));
    lines.extend(letter_index_lines(letters, rule_index, prefix)?);
    Ok(lines.join("\n") + "\n")
}

/// Parses the WFSTs for `letters` from `wfst_dir` and writes
/// `<c_dir>/<prefix>_lts_rules.c`.
pub fn write_c(
    prefix: &str,
    letters: &[String],
    wfst_dir: &Path,
    c_dir: &Path,
) -> anyhow::Result<()> {
    let (models, rule_index, phone_table) = extract_models(letters, wfst_dir)?;
    let source = render_c(prefix, letters, &models, &rule_index, &phone_table)?;
    fs::create_dir_all(c_dir)?;
    fs::write(c_dir.join(format!("{}_lts_rules.c", prefix)), source)?;
    Ok(())
}
