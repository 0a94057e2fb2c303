//! Driver for the external collaborators. Tree learning is delegated to
//! `wagon` and WFST construction to `wfst_build`, both spawned synchronously
//! with their output tee'd to a per-invocation log file. The contract with
//! them is purely file based: we write the training rows and the feature
//! description, they write a tree.
//!
//! Both binaries are located once at startup, from the `WAGON` and
//! `WFST_BUILD` environment variables when set, falling back to a `$PATH`
//! search. Exit status is checked: a nonzero exit or a missing output file
//! aborts the run.
use crate::align::{Allowables, EPSILON};
use crate::error::LtsError;
use crate::features::FeatureRow;
use crate::progress::progress_bar;
use std::env;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Resolved locations of the external binaries.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub wagon: PathBuf,
    pub wfst_build: PathBuf,
}

impl ToolPaths {
    pub fn resolve() -> Result<Self, LtsError> {
        Ok(Self {
            wagon: resolve_tool("wagon", "WAGON")?,
            wfst_build: resolve_tool("wfst_build", "WFST_BUILD")?,
        })
    }
}

fn resolve_tool(tool: &str, env_var: &str) -> Result<PathBuf, LtsError> {
    if let Ok(path) = env::var(env_var) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }
    which::which(tool).map_err(|_| LtsError::SubprocessMissing {
        tool: tool.to_string(),
        env: env_var.to_string(),
    })
}

/// Runs a collaborator with stdout and stderr appended to `log_path` and
/// checks it both exited cleanly and produced `output`.
pub(crate) fn run_logged(
    tool: &Path,
    args: &[OsString],
    log_path: &Path,
    output: &Path,
) -> anyhow::Result<()> {
    let log = File::create(log_path)?;
    let stderr_log = log.try_clone()?;
    debug!("Running {} {:?}", tool.display(), args);
    let status = Command::new(tool)
        .args(args)
        .stdout(log)
        .stderr(stderr_log)
        .status()?;
    if !status.success() || !output.exists() {
        return Err(LtsError::SubprocessFailed {
            tool: tool.display().to_string(),
            output: output.to_path_buf(),
            log: log_path.to_path_buf(),
        }
        .into());
    }
    Ok(())
}

fn os_args(args: &[&str]) -> Vec<OsString> {
    args.iter().map(OsString::from).collect()
}

/// Trains one tree per letter. Rows are sharded by the central letter into
/// `ltsdataTRAIN.<letter>.feats`, the learner's tree lands in
/// `lts.<letter>.tree`. A letter with no rows gets a synthetic leaf instead,
/// the learner cannot compute an impurity for an empty file.
pub fn train_letter_trees(
    allowables: &Allowables,
    rows: &[FeatureRow],
    feat_central: usize,
    stop: u32,
    scratch_dir: &Path,
    desc_path: &Path,
    wagon: &Path,
) -> anyhow::Result<()> {
    let letters = allowables.letters();
    for (i, letter) in letters.iter().enumerate() {
        progress_bar(i, letters.len());
        let letter_rows: Vec<&FeatureRow> = rows
            .iter()
            .filter(|row| row.get(feat_central).map(String::as_str) == Some(letter.as_str()))
            .collect();
        let input_path = scratch_dir.join(format!("ltsdataTRAIN.{}.feats", letter));
        let output_path = scratch_dir.join(format!("lts.{}.tree", letter));
        if letter_rows.is_empty() {
            let phones = allowables
                .phones(letter)
                .map(|set| set.iter().cloned().collect::<Vec<_>>())
                .unwrap_or_default();
            let mut out = File::create(&output_path)?;
            write_uniform_leaf(&phones, &mut out)?;
            continue;
        }
        let mut input = io::BufWriter::new(File::create(&input_path)?);
        for row in &letter_rows {
            writeln!(input, "{}", row.join(" "))?;
        }
        input.flush()?;
        let log_path = scratch_dir.join(format!("wagon_{}.log", letter));
        let args = os_args(&[
            "-data",
            &input_path.to_string_lossy(),
            "-test",
            &input_path.to_string_lossy(),
            "-desc",
            &desc_path.to_string_lossy(),
            "-stop",
            &stop.to_string(),
            "-output",
            &output_path.to_string_lossy(),
        ]);
        run_logged(wagon, &args, &log_path, &output_path)?;
    }
    Ok(())
}

/// A hand built leaf for letters with no training samples: uniform weights
/// over the allowed non-epsilon phones, predicting silence.
fn write_uniform_leaf(phones: &[String], writer: &mut impl Write) -> io::Result<()> {
    let phones: Vec<&String> = phones.iter().filter(|p| p.as_str() != EPSILON).collect();
    if phones.is_empty() {
        return write!(writer, "(({}))", EPSILON);
    }
    let weight = 1.0 / phones.len() as f64;
    let pairs: Vec<String> = phones
        .iter()
        .map(|p| format!("({} {})", p, weight))
        .collect();
    write!(writer, "(({} {}))", pairs.join(" "), EPSILON)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sexpr;
    use crate::tree::Tree;

    #[test]
    fn uniform_leaf_excludes_epsilon_and_predicts_silence() {
        let phones = vec![EPSILON.to_string(), "x".to_string(), "y".to_string()];
        let mut buf = Vec::new();
        write_uniform_leaf(&phones, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "(((x 0.5) (y 0.5) _epsilon_))");
        let tree = Tree::from_value(&sexpr::parse(&text).unwrap()).unwrap();
        assert_eq!(
            tree,
            Tree::Leaf {
                weights: vec![("x".into(), 0.5), ("y".into(), 0.5)],
                phone: EPSILON.into(),
            }
        );
    }

    #[test]
    fn uniform_leaf_with_no_phones_is_bare_epsilon() {
        let phones = vec![EPSILON.to_string()];
        let mut buf = Vec::new();
        write_uniform_leaf(&phones, &mut buf).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "((_epsilon_))");
    }

    #[test]
    fn missing_tool_reports_the_env_override() {
        let err = resolve_tool("definitely-not-a-real-binary-1234", "NOT_A_REAL_ENV").unwrap_err();
        assert!(matches!(err, LtsError::SubprocessMissing { .. }));
        assert!(err.to_string().contains("NOT_A_REAL_ENV"));
    }
}
