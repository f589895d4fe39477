//! Tagwise CLI - Command-line interface
//!
//! Usage:
//!   tagwise tokenize <text>
//!   tagwise build-extractor --vectors <txt> --output <path>
//!   tagwise train-ner --extractor <path> --conll <file> --output <path> [--beta <b>]
//!   tagwise tag --model <path> <text>
//!   tagwise evaluate --model <path> --conll <file>
//!   tagwise train-relation --model <ner> --data <jsonl> --relation <name> --output <path>
//!   tagwise relations --model <ner> --detector <path>... <text>
//!   tagwise train-categorizer --extractor <path> --data <tsv> --output <path>
//!   tagwise categorize --model <path> <text>

use std::fs;
use std::io::{self, Read};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tagwise_core::{tokenize, tokens_from_words, EngineConfig, LoggingConfig};
use tagwise_extractor::{
    detect_relations, evaluate_named_entity_recognizer, parse_conll_file, BinaryRelationDetector,
    BinaryRelationTrainer, CategorizerTrainer, NamedEntityExtractor, NerTrainer, TextCategorizer,
    WordFeatureExtractor,
};

#[derive(Parser)]
#[command(name = "tagwise")]
#[command(about = "Entity tagging, relation detection and text categorization")]
#[command(version)]
struct Cli {
    /// TOML configuration file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ModelArgs {
    /// Model file
    #[arg(long)]
    model: PathBuf,
    /// Word feature extractor, required for separately saved models
    #[arg(long)]
    extractor: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Split text into tokens, one per line
    Tokenize {
        /// Text to tokenize; read from stdin when absent
        text: Option<String>,
    },
    /// Build a word feature extractor from a text vector file
    BuildExtractor {
        /// GloVe or word2vec text file
        #[arg(long)]
        vectors: PathBuf,
        #[arg(long)]
        output: PathBuf,
    },
    /// Train a named entity extractor on CoNLL-2003 data
    TrainNer {
        #[arg(long)]
        extractor: PathBuf,
        #[arg(long)]
        conll: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// Save without the word feature extractor
        #[arg(long)]
        separate: bool,
        /// Worker threads; defaults to the configured count
        #[arg(long)]
        threads: Option<usize>,
        /// Precision/recall trade-off; below 1 favours precision
        #[arg(long)]
        beta: Option<f64>,
    },
    /// Tag entities in text
    Tag {
        #[command(flatten)]
        model: ModelArgs,
        /// Emit JSON instead of plain text
        #[arg(long)]
        json: bool,
        text: Option<String>,
    },
    /// Measure precision and recall on CoNLL-2003 data
    Evaluate {
        #[command(flatten)]
        model: ModelArgs,
        #[arg(long)]
        conll: PathBuf,
    },
    /// Train a binary relation detector from JSON lines examples
    TrainRelation {
        #[command(flatten)]
        model: ModelArgs,
        /// One `{"tokens": [...], "arg1": [s, e], "arg2": [s, e], "positive": bool}` per line
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        relation: String,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        threads: Option<usize>,
    },
    /// Tag text and report relations between neighbouring entities
    Relations {
        #[command(flatten)]
        model: ModelArgs,
        /// Relation detector files
        #[arg(long = "detector", required = true)]
        detectors: Vec<PathBuf>,
        text: Option<String>,
    },
    /// Train a text categorizer from `label<TAB>text` lines
    TrainCategorizer {
        #[arg(long)]
        extractor: PathBuf,
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        separate: bool,
        #[arg(long)]
        threads: Option<usize>,
    },
    /// Assign a category to text
    Categorize {
        #[command(flatten)]
        model: ModelArgs,
        text: Option<String>,
    },
}

#[derive(Deserialize)]
struct RelationExample {
    tokens: Vec<String>,
    arg1: [usize; 2],
    arg2: [usize; 2],
    positive: bool,
}

impl RelationExample {
    fn args(&self) -> (Range<usize>, Range<usize>) {
        (self.arg1[0]..self.arg1[1], self.arg2[0]..self.arg2[1])
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_file(path)?.with_env_override()?,
        None => EngineConfig::from_env()?,
    };
    Ok(config)
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "tagwise={0},tagwise_core={0},tagwise_extractor={0}",
            logging.level
        ))
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_file(logging.include_location)
        .with_line_number(logging.include_location);
    if logging.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read_text(text: Option<String>) -> anyhow::Result<String> {
    match text {
        Some(text) => Ok(text),
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}

fn load_ner(args: &ModelArgs) -> anyhow::Result<NamedEntityExtractor> {
    let ner = match &args.extractor {
        Some(path) => {
            let extractor = Arc::new(WordFeatureExtractor::load(path)?);
            NamedEntityExtractor::load_with_extractor(&args.model, extractor)?
        }
        None => NamedEntityExtractor::load(&args.model)?,
    };
    Ok(ner)
}

fn load_categorizer(args: &ModelArgs) -> anyhow::Result<TextCategorizer> {
    let categorizer = match &args.extractor {
        Some(path) => {
            let extractor = Arc::new(WordFeatureExtractor::load(path)?);
            TextCategorizer::load_with_extractor(&args.model, extractor)?
        }
        None => TextCategorizer::load(&args.model)?,
    };
    Ok(categorizer)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_logging(&config.logging);

    match cli.command {
        Commands::Tokenize { text } => {
            for token in tokenize(&read_text(text)?) {
                println!("{}", token);
            }
        }
        Commands::BuildExtractor { vectors, output } => {
            let extractor = WordFeatureExtractor::from_text_vectors(&vectors)?;
            extractor.save(&output)?;
            println!(
                "Saved extractor with {} words and {} dimensions to {}",
                extractor.vocabulary_size(),
                extractor.num_dimensions(),
                output.display()
            );
        }
        Commands::TrainNer {
            extractor,
            conll,
            output,
            separate,
            threads,
            beta,
        } => {
            let extractor = Arc::new(WordFeatureExtractor::load(&extractor)?);
            let threads = threads.unwrap_or(config.training.thread_count);
            let mut trainer = NerTrainer::new(extractor).with_config(config)?;
            if let Some(beta) = beta {
                trainer.set_beta(beta)?;
            }
            for instance in parse_conll_file(&conll)? {
                trainer.add(instance)?;
            }
            info!("Training on {} sentences with {} threads", trainer.size(), threads);

            if separate {
                trainer.train_separate_models(threads, &output)?;
            } else {
                trainer.train(threads)?.save(&output)?;
            }
            println!("Saved NER model to {}", output.display());
        }
        Commands::Tag { model, json, text } => {
            let ner = load_ner(&model)?;
            let entities = ner.extract_entities(&read_text(text)?)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entities)?);
            } else {
                for e in entities {
                    println!("{}\t{}\t{}..{}\t{:.3}", e.label, e.text, e.start, e.end, e.score);
                }
            }
        }
        Commands::Evaluate { model, conll } => {
            let ner = load_ner(&model)?;
            let instances = parse_conll_file(&conll)?;
            let evaluation = evaluate_named_entity_recognizer(&ner, &instances)?;
            print!("{}", evaluation.report());
        }
        Commands::TrainRelation {
            model,
            data,
            relation,
            output,
            threads,
        } => {
            let ner = load_ner(&model)?;
            let threads = threads.unwrap_or(config.training.thread_count);
            let mut trainer =
                BinaryRelationTrainer::new(relation, Arc::clone(ner.feature_extractor()))
                    .with_config(config)?;

            let contents = fs::read_to_string(&data)
                .with_context(|| format!("failed to read {}", data.display()))?;
            for (i, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let example: RelationExample = serde_json::from_str(line)
                    .with_context(|| format!("{}:{}", data.display(), i + 1))?;
                let tokens = tokens_from_words(&example.tokens);
                let (arg1, arg2) = example.args();
                if example.positive {
                    trainer.add_positive_binary_relation(&tokens, arg1, arg2)?;
                } else {
                    trainer.add_negative_binary_relation(&tokens, arg1, arg2)?;
                }
            }

            let detector = trainer.train(threads)?;
            detector.save(&output)?;
            println!(
                "Saved '{}' detector ({} positive, {} negative) to {}",
                detector.relation_type(),
                trainer.num_positive_examples(),
                trainer.num_negative_examples(),
                output.display()
            );
        }
        Commands::Relations {
            model,
            detectors,
            text,
        } => {
            let ner = load_ner(&model)?;
            let detectors = detectors
                .iter()
                .map(BinaryRelationDetector::load)
                .collect::<Result<Vec<_>, _>>()?;

            let text = read_text(text)?;
            let tokens = tokenize(&text);
            let mentions = ner.tag(&tokens)?;
            let relations = detect_relations(ner.feature_extractor(), &tokens, &mentions, &detectors)?;
            let span = |r: &Range<usize>| {
                tokens[r.clone()]
                    .iter()
                    .map(|t| t.text.as_str())
                    .collect::<Vec<_>>()
                    .join(" ")
            };
            for r in &relations {
                println!(
                    "{}\t{}\t{}\t{:.3}",
                    r.relation_type,
                    span(&r.arg1),
                    span(&r.arg2),
                    r.score
                );
            }
        }
        Commands::TrainCategorizer {
            extractor,
            data,
            output,
            separate,
            threads,
        } => {
            let extractor = Arc::new(WordFeatureExtractor::load(&extractor)?);
            let threads = threads.unwrap_or(config.training.thread_count);
            let mut trainer = CategorizerTrainer::new(extractor).with_config(config)?;

            let contents = fs::read_to_string(&data)
                .with_context(|| format!("failed to read {}", data.display()))?;
            for (i, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let Some((label, text)) = line.split_once('\t') else {
                    bail!("{}:{}: expected label<TAB>text", data.display(), i + 1);
                };
                trainer.add(tokenize(text), label.trim())?;
            }

            if separate {
                trainer.train_separate_models(threads, &output)?;
            } else {
                trainer.train(threads)?.save(&output)?;
            }
            println!("Saved categorizer ({} documents) to {}", trainer.size(), output.display());
        }
        Commands::Categorize { model, text } => {
            let categorizer = load_categorizer(&model)?;
            let (label, score) = categorizer.categorize(&tokenize(&read_text(text)?))?;
            println!("{}\t{:.3}", label, score);
        }
    }

    Ok(())
}
