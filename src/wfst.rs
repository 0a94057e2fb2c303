//! Lowering from decision trees to weighted finite state transducers. A tree
//! walks into a regular grammar first - one state per node, two labelled arcs
//! per condition, a terminal phone arc per leaf - and the external builder
//! then determinizes and minimizes that grammar into the WFST the C emitter
//! packs.
use crate::align::EPSILON;
use crate::progress::progress_bar;
use crate::tree::{RuleSet, Tree};
use crate::wagon::run_logged;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// An arc of the regular grammar for one letter's tree.
#[derive(Debug, Clone, PartialEq)]
pub enum RgArc {
    /// Condition arc: `(sA -> "_feat_is_letter_" sB)`. The `not` labelled arc
    /// of a node carries the same condition text prefixed with `not_`.
    Branch {
        src: usize,
        label: String,
        dst: usize,
    },
    /// Leaf arc: `(sA -> phone)`.
    Terminal { src: usize, phone: String },
}

/// Walks a weight-stripped tree into its arc list. States are numbered from
/// `s1` at the root, each condition node allocating the next two states for
/// its yes and no children.
pub fn tree_to_arcs(tree: &Tree) -> Vec<RgArc> {
    let mut arcs = vec![];
    let mut num_states = 1;
    walk(tree, &mut arcs, &mut num_states, 1);
    arcs
}

fn walk(tree: &Tree, arcs: &mut Vec<RgArc>, num_states: &mut usize, this_node: usize) {
    match tree {
        Tree::Leaf { phone, .. } => {
            let phone = if phone == EPSILON { "epsilon" } else { phone };
            arcs.push(RgArc::Terminal {
                src: this_node,
                phone: phone.to_string(),
            });
        }
        Tree::Node {
            feat,
            value,
            yes,
            no,
        } => {
            let true_daughter = *num_states + 1;
            let false_daughter = *num_states + 2;
            arcs.push(RgArc::Branch {
                src: this_node,
                label: format!("_{}_is_{}_", feat, value),
                dst: true_daughter,
            });
            arcs.push(RgArc::Branch {
                src: this_node,
                label: format!("_not_{}_is_{}_", feat, value),
                dst: false_daughter,
            });
            *num_states += 2;
            walk(yes, arcs, num_states, true_daughter);
            walk(no, arcs, num_states, false_daughter);
        }
    }
}

/// Writes one tree's `(RegularGrammar name nil (arcs))` file.
pub fn write_rg(tree: &Tree, writer: &mut impl Write) -> io::Result<()> {
    writeln!(writer, "(RegularGrammar\n name\n nil\n (")?;
    for arc in tree_to_arcs(tree) {
        match arc {
            RgArc::Branch { src, label, dst } => {
                writeln!(writer, "(s{} -> \"{}\" s{})", src, label, dst)?;
            }
            RgArc::Terminal { src, phone } => {
                writeln!(writer, "(s{} -> {})", src, phone)?;
            }
        }
    }
    writeln!(writer, "))")
}

/// Lowers every letter's tree: grammar to `<rg_dir>/<letter>.tree.rg`, then
/// the builder's WFST to `<wfst_dir>/<letter>.tree.wfst` with its log beside
/// it.
pub fn lower_to_wfst(
    rules: &RuleSet,
    rg_dir: &Path,
    wfst_dir: &Path,
    wfst_build: &Path,
) -> anyhow::Result<()> {
    fs::create_dir_all(rg_dir)?;
    fs::create_dir_all(wfst_dir)?;
    for (i, (letter, tree)) in rules.iter().enumerate() {
        progress_bar(i, rules.len());
        let rg_path = rg_dir.join(format!("{}.tree.rg", letter));
        let mut writer = BufWriter::new(File::create(&rg_path)?);
        write_rg(tree, &mut writer)?;
        writer.flush()?;
        let wfst_path = wfst_dir.join(format!("{}.tree.wfst", letter));
        let log_path = wfst_dir.join(format!("{}_rg_to_wfst.log", letter));
        let args: Vec<OsString> = [
            "-heap",
            "10000000",
            "-type",
            "rg",
            "-detmin",
            "-o",
            &wfst_path.to_string_lossy(),
            &rg_path.to_string_lossy(),
        ]
        .iter()
        .map(OsString::from)
        .collect();
        run_logged(wfst_build, &args, &log_path, &wfst_path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(phone: &str) -> Tree {
        Tree::Leaf {
            weights: vec![],
            phone: phone.into(),
        }
    }

    fn node(feat: &str, value: &str, yes: Tree, no: Tree) -> Tree {
        Tree::Node {
            feat: feat.into(),
            value: value.into(),
            yes: Box::new(yes),
            no: Box::new(no),
        }
    }

    #[test]
    fn single_condition_tree_lowers_to_four_arcs() {
        let tree = node("n.name", "c", leaf("x"), leaf("y"));
        assert_eq!(
            tree_to_arcs(&tree),
            vec![
                RgArc::Branch {
                    src: 1,
                    label: "_n.name_is_c_".into(),
                    dst: 2
                },
                RgArc::Branch {
                    src: 1,
                    label: "_not_n.name_is_c_".into(),
                    dst: 3
                },
                RgArc::Terminal {
                    src: 2,
                    phone: "x".into()
                },
                RgArc::Terminal {
                    src: 3,
                    phone: "y".into()
                },
            ]
        );
    }

    #[test]
    fn nested_trees_number_states_depth_first() {
        let tree = node(
            "n.name",
            "c",
            node("p.name", "a", leaf("x"), leaf(EPSILON)),
            leaf("y"),
        );
        let arcs = tree_to_arcs(&tree);
        assert_eq!(
            arcs,
            vec![
                RgArc::Branch {
                    src: 1,
                    label: "_n.name_is_c_".into(),
                    dst: 2
                },
                RgArc::Branch {
                    src: 1,
                    label: "_not_n.name_is_c_".into(),
                    dst: 3
                },
                RgArc::Branch {
                    src: 2,
                    label: "_p.name_is_a_".into(),
                    dst: 4
                },
                RgArc::Branch {
                    src: 2,
                    label: "_not_p.name_is_a_".into(),
                    dst: 5
                },
                RgArc::Terminal {
                    src: 4,
                    phone: "x".into()
                },
                // The epsilon phone is spelled out for the builder.
                RgArc::Terminal {
                    src: 5,
                    phone: "epsilon".into()
                },
                RgArc::Terminal {
                    src: 3,
                    phone: "y".into()
                },
            ]
        );
    }

    #[test]
    fn grammar_file_layout() {
        let tree = node("n.name", "c", leaf("x"), leaf("y"));
        let mut buf = Vec::new();
        write_rg(&tree, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "(RegularGrammar\n name\n nil\n (\n\
             (s1 -> \"_n.name_is_c_\" s2)\n\
             (s1 -> \"_not_n.name_is_c_\" s3)\n\
             (s2 -> x)\n\
             (s3 -> y)\n\
             ))\n"
        );
    }
}
