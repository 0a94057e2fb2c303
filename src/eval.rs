//! Replays a trained model over data it has an answer key for: the training
//! alignment for the accuracy report, or a whole lexicon for pruning away
//! entries the rules already get right.
use crate::align::{AlignRecord, EPSILON};
use crate::error::LtsError;
use crate::lexicon::{word_letters, Heteronym, Lexicon};
use crate::progress::progress_bar;
use crate::tree::{RuleSet, Tree};
use std::collections::BTreeMap;
use std::io::Write;
use tracing::{info, warn};

/// Letter keyed view of a rule set for prediction.
pub fn rules_by_letter(rules: &RuleSet) -> BTreeMap<&str, &Tree> {
    rules
        .iter()
        .map(|(letter, tree)| (letter.as_str(), tree))
        .collect()
}

/// Predicts the phone for every letter by evaluating that letter's tree over
/// the padded word. A letter with no tree yields an empty prediction, the
/// word can't be predicted at all. With `keep_silences` unset the epsilon
/// phones are dropped from the output.
pub fn predict_letters(
    letters: &[String],
    rules: &BTreeMap<&str, &Tree>,
    keep_silences: bool,
) -> Result<Vec<String>, LtsError> {
    let mut padded: Vec<String> = vec!["0".into(), "0".into(), "#".into()];
    padded.extend(letters.iter().cloned());
    padded.extend(["#".into(), "0".into(), "0".into()]);
    let mut phones = vec![];
    for index in 3..padded.len() - 3 {
        let letter = &padded[index];
        let Some(tree) = rules.get(letter.as_str()) else {
            warn!(
                "Missing letter {} in LTS rules for word {}",
                letter,
                letters.concat()
            );
            return Ok(vec![]);
        };
        phones.push(tree.predict(&padded, index)?.to_string());
    }
    if !keep_silences {
        phones.retain(|p| p != EPSILON);
    }
    Ok(phones)
}

/// Drops epsilons and splits fused pairs so predictions and lexicon phones
/// compare in the same alphabet.
pub fn phone_normalize(phones: &[String]) -> Vec<String> {
    phones
        .iter()
        .filter(|p| p.as_str() != EPSILON)
        .flat_map(|p| p.split('-').map(str::to_string))
        .collect()
}

/// Word accuracy of the rules over an alignment file. Mismatches go to the
/// log writer when one is given.
pub fn test_rules(
    records: &[AlignRecord],
    rules: &RuleSet,
    mut mismatch_log: Option<&mut dyn Write>,
) -> anyhow::Result<f64> {
    let by_letter = rules_by_letter(rules);
    let mut right = 0usize;
    let mut wrong = 0usize;
    for (i, record) in records.iter().enumerate() {
        progress_bar(i, records.len());
        let predicted = predict_letters(&record.letters, &by_letter, true)?;
        let norm_phones = phone_normalize(&record.phones);
        let norm_predicted = phone_normalize(&predicted);
        if norm_phones == norm_predicted {
            right += 1;
        } else {
            wrong += 1;
            if let Some(log) = mismatch_log.as_deref_mut() {
                writeln!(
                    log,
                    "{} expected [{}] got [{}]",
                    record.letters.concat(),
                    norm_phones.join(" "),
                    norm_predicted.join(" ")
                )?;
            }
        }
    }
    if right + wrong == 0 {
        warn!("No alignment records to test against");
        return Ok(0.0);
    }
    Ok(right as f64 / (right + wrong) as f64)
}

/// Keeps only the lexicon entries the rules mispredict, plus every entry of
/// words with more than one pronunciation - the rules can only ever produce
/// one, so heteronyms must stay listed.
pub fn prune_lexicon(lexicon: &Lexicon, rules: &RuleSet) -> anyhow::Result<Lexicon> {
    let by_letter = rules_by_letter(rules);
    let mut pruned = Lexicon::default();
    let mut kept = 0usize;
    for (i, (word, heteronyms)) in lexicon.iter().enumerate() {
        progress_bar(i, lexicon.len());
        let word_lower = word.to_lowercase();
        let predicted = predict_letters(&word_letters(&word_lower), &by_letter, false)?;
        for heteronym in heteronyms {
            if heteronym.phones != predicted || heteronyms.len() > 1 {
                kept += 1;
                pruned.insert(
                    word_lower.clone(),
                    Heteronym {
                        pos: heteronym.pos.clone(),
                        syllables: heteronym.syllables.clone(),
                        phones: heteronym.phones.clone(),
                    },
                );
            }
        }
    }
    info!("Kept {} entries the rules cannot reproduce", kept);
    Ok(pruned)
}
