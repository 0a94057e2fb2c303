use clap::{ArgAction, Parser, Subcommand};
use lts_trainer::align::{self, Allowables, CooccurrenceTable};
use lts_trainer::eval;
use lts_trainer::features;
use lts_trainer::lexicon::{FilterOptions, Lexicon};
use lts_trainer::tree;
use lts_trainer::wagon::{self, ToolPaths};
use lts_trainer::wfst;
use lts_trainer::emit;
use std::env;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
pub struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train letter to sound rules from a pronunciation lexicon and compile
    /// them down to C tables
    Train {
        /// The lexicon that will be used to train the rules
        #[clap(long)]
        lexicon: PathBuf,
        /// The lexicon format is flat (no syllables)
        #[clap(long, overrides_with = "lexicon_fmt_noflat")]
        lexicon_fmt_flat: bool,
        /// The lexicon format carries syllable structure (the default)
        #[clap(long)]
        lexicon_fmt_noflat: bool,
        /// Prefix for the outputs, typically the language code (e.g. 'cmu', 'fr')
        #[clap(long = "lang-prefix")]
        prefix: String,
        /// Before training, drop lexicon words with fewer characters than this
        #[clap(long = "filter-remove-shorter-than", default_value_t = 4)]
        minlength: usize,
        /// Before training, lowercase words in the lexicon
        #[clap(long = "filter-lowercase", default_value_t = true, action = ArgAction::Set)]
        lowercase: bool,
        /// Before training, remove words with letters missing from the allowables
        #[clap(long = "filter-invalid-letters", default_value_t = true, action = ArgAction::Set)]
        invalid_letters: bool,
        /// Minimum number of samples for the learner's leaf nodes
        #[clap(long = "wagon-stop", default_value_t = 3)]
        wagon_stop: u32,
        /// Path to the allowables json file
        #[clap(long)]
        allowables: PathBuf,
        /// Path to a json list of feature names for the learner's description
        /// file, defaults to the nine letter window plus label and pos
        #[clap(long = "feat-names")]
        feat_names: Option<PathBuf>,
    },
    /// Measure word accuracy of trained rules over an alignment file
    Test {
        /// The lex.align file written during training
        #[clap(long)]
        align: PathBuf,
        /// The merged rules scm file
        #[clap(long = "lts-rules")]
        lts_rules: PathBuf,
        /// Write one line per mispredicted word to this file
        #[clap(long)]
        log: Option<PathBuf>,
    },
    /// Drop lexicon entries the trained rules already predict correctly
    Prune {
        /// Path to the lexicon file in festival format
        #[clap(long)]
        lexicon: PathBuf,
        /// The lexicon format is flat (no syllables)
        #[clap(long, overrides_with = "lexicon_fmt_noflat")]
        lexicon_fmt_flat: bool,
        /// The lexicon format carries syllable structure (the default)
        #[clap(long)]
        lexicon_fmt_noflat: bool,
        /// The merged rules scm file
        #[clap(long = "lts-rules")]
        lts_rules: PathBuf,
        /// Lexicon output file, only with words not predicted correctly by the rules
        #[clap(long)]
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    lts_trainer::setup_logging();
    let args = Args::parse();
    match args.command {
        Commands::Train {
            lexicon,
            lexicon_fmt_flat,
            lexicon_fmt_noflat: _,
            prefix,
            minlength,
            lowercase,
            invalid_letters,
            wagon_stop,
            allowables,
            feat_names,
        } => train(TrainConfig {
            lexicon,
            flat: lexicon_fmt_flat,
            prefix,
            minlength,
            lowercase,
            invalid_letters,
            wagon_stop,
            allowables,
            feat_names,
        }),
        Commands::Test {
            align,
            lts_rules,
            log,
        } => test(&align, &lts_rules, log.as_deref()),
        Commands::Prune {
            lexicon,
            lexicon_fmt_flat,
            lexicon_fmt_noflat: _,
            lts_rules,
            output,
        } => prune(&lexicon, lexicon_fmt_flat, &lts_rules, &output),
    }
}

struct TrainConfig {
    lexicon: PathBuf,
    flat: bool,
    prefix: String,
    minlength: usize,
    lowercase: bool,
    invalid_letters: bool,
    wagon_stop: u32,
    allowables: PathBuf,
    feat_names: Option<PathBuf>,
}

fn train(config: TrainConfig) -> anyhow::Result<()> {
    // Locate the collaborators before doing any work, a missing binary
    // should not cost an alignment pass to discover.
    let tools = ToolPaths::resolve()?;
    let allowables = Allowables::open(&config.allowables)?;
    let feat_names: Vec<String> = match &config.feat_names {
        Some(path) => serde_json::from_reader(BufReader::new(File::open(path)?))?,
        None => features::DEFAULT_FEAT_NAMES
            .iter()
            .map(|s| s.to_string())
            .collect(),
    };
    let feat_central = features::central_feature(&feat_names)?;

    let work_dir = env::current_dir()?;
    let scratch_dir = work_dir.join(format!("{}_lts_scratch", config.prefix));
    let wfst_dir = work_dir.join(format!("{}_wfst", config.prefix));
    let c_dir = work_dir.join(format!("{}_c", config.prefix));
    let rules_path = work_dir.join(format!("{}_lts_rules.scm", config.prefix));
    let align_path = scratch_dir.join("lex.align");
    let failed_path = scratch_dir.join("failed_align.txt");
    let feats_path = scratch_dir.join("lex.feats");
    let desc_path = scratch_dir.join("ltsLTS.desc");
    fs::create_dir_all(&scratch_dir)?;

    info!("1. Load lexicon in festival format");
    let lexicon = Lexicon::open(&config.lexicon, config.flat, &[])?;
    info!("Lexicon size (words): {}", lexicon.len());

    info!("2. Filter lexicon: removing short words and converting to lower case");
    let filtered = lexicon.filter(&FilterOptions {
        min_length: config.minlength,
        lowercase: config.lowercase,
        remove_invalid_letters: config.invalid_letters,
        allowables: Some(&allowables),
    })?;
    info!("Filtered lexicon size (words): {}", filtered.len());

    info!("3.1. Count probabilities of letter-phone pairs");
    let mut table = CooccurrenceTable::new(&allowables);
    let failures = align::cumulate_pairs(&filtered, &mut table);
    let mut failed_writer = BufWriter::new(File::create(&failed_path)?);
    serde_json::to_writer_pretty(&mut failed_writer, &failures)?;
    failed_writer.flush()?;
    let table = table.normalised();

    info!("3.2. Align letters with phones");
    let (aligned, align_failed) = align::align_data(&filtered, &table);
    if !align_failed.is_empty() {
        warn!(
            "{} entries had no alignment under the normalised scores, e.g. {}",
            align_failed.len(),
            align_failed[0].word
        );
    }
    let mut align_writer = BufWriter::new(File::create(&align_path)?);
    align::save_lex_align(&aligned, &mut align_writer)?;
    align_writer.flush()?;

    info!("3.3. Build feature file");
    let rows = features::build_feat_rows(&aligned);
    let mut feats_writer = BufWriter::new(File::create(&feats_path)?);
    features::write_feats(&rows, &mut feats_writer)?;
    feats_writer.flush()?;
    let mut desc_writer = BufWriter::new(File::create(&desc_path)?);
    features::write_description(&rows, &feat_names, &mut desc_writer)?;
    desc_writer.flush()?;

    info!("4. Build LTS models");
    wagon::train_letter_trees(
        &allowables,
        &rows,
        feat_central,
        config.wagon_stop,
        &scratch_dir,
        &desc_path,
        &tools.wagon,
    )?;

    info!("5. Merge LTS models");
    let rules = tree::merge_models(&allowables.letters(), &scratch_dir)?;
    tree::save_rules(&format!("{}_lts_rules", config.prefix), &rules, &rules_path)?;

    info!("6. Test LTS model");
    let records = align::read_align(BufReader::new(File::open(&align_path)?))?;
    let accuracy = eval::test_rules(&records, &rules, None)?;
    info!(
        "LTS word accuracy on train set (cmulex expected ~60%): {:.1}%",
        accuracy * 100.0
    );

    info!("7. Convert LTS to C code");
    wfst::lower_to_wfst(&rules, &wfst_dir, &wfst_dir, &tools.wfst_build)?;
    let letters: Vec<String> = rules.iter().map(|(letter, _)| letter.clone()).collect();
    emit::write_c(&config.prefix, &letters, &wfst_dir, &c_dir)?;
    info!(
        "Wrote {}",
        c_dir.join(format!("{}_lts_rules.c", config.prefix)).display()
    );
    Ok(())
}

fn test(
    align: &std::path::Path,
    lts_rules: &std::path::Path,
    log: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    let records = align::read_align(BufReader::new(File::open(align)?))?;
    let rules = tree::load_rules(lts_rules)?;
    let mut log_writer = match log {
        Some(path) => Some(BufWriter::new(File::create(path)?)),
        None => None,
    };
    let accuracy = eval::test_rules(
        &records,
        &rules,
        log_writer.as_mut().map(|w| w as &mut dyn Write),
    )?;
    if let Some(mut w) = log_writer {
        w.flush()?;
    }
    info!(
        "LTS word accuracy on train set (cmulex expected ~60%): {:.1}%",
        accuracy * 100.0
    );
    Ok(())
}

fn prune(
    lexicon: &std::path::Path,
    flat: bool,
    lts_rules: &std::path::Path,
    output: &std::path::Path,
) -> anyhow::Result<()> {
    let lexicon = Lexicon::open(lexicon, flat, &[])?;
    let rules = tree::load_rules(lts_rules)?;
    let pruned = eval::prune_lexicon(&lexicon, &rules)?;
    info!(
        "Pruned lexicon from {} to {} words",
        lexicon.len(),
        pruned.len()
    );
    pruned.save(output)?;
    Ok(())
}
