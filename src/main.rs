use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// dupeguard - Fuzzy duplicate checker for business records before they are submitted
#[derive(Parser)]
#[command(name = "dupeguard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true, default_value = ".dupeguard.toml")]
    config: PathBuf,

    /// Quiet mode - suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a candidate record against existing records (exit 1 if a duplicate is found)
    Check {
        /// Entity kind: currency, payment-method, tax-type, or one defined in config
        #[arg(short, long)]
        kind: String,

        /// JSON file with existing records ('-' reads stdin)
        #[arg(short, long)]
        list: PathBuf,

        /// Candidate field as name=value (can be repeated)
        #[arg(short, long = "field")]
        fields: Vec<String>,

        /// Similarity threshold (0 to 100)
        #[arg(short, long)]
        threshold: Option<u32>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the similarity percentage between two strings
    Compare {
        /// First string
        a: String,

        /// Second string
        b: String,

        /// Similarity threshold (0 to 100)
        #[arg(short, long)]
        threshold: Option<u32>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Find duplicate pairs within one record list (exit 1 if any are found)
    Scan {
        /// Entity kind: currency, payment-method, tax-type, or one defined in config
        #[arg(short, long)]
        kind: String,

        /// JSON file with existing records ('-' reads stdin)
        #[arg(short, long)]
        list: PathBuf,

        /// Similarity threshold (0 to 100)
        #[arg(short, long)]
        threshold: Option<u32>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the effective match rules (built-ins merged with config)
    Rules {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

const DEFAULT_THRESHOLD: u32 = 65;
const SCAN_DISPLAY_LIMIT: usize = 50;

/// How per-field similarity verdicts combine into a duplicate verdict.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Combine {
    Any,
    All,
}

impl fmt::Display for Combine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Combine::Any => write!(f, "any"),
            Combine::All => write!(f, "all"),
        }
    }
}

/// Declarative match rule for one entity kind: which fields carry identity,
/// how their verdicts combine, and an optional partition field whose exact
/// equality is a precondition for two records to be comparable at all.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct MatchRule {
    fields: Vec<String>,
    combine: Combine,
    partition: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct Config {
    threshold: Option<u32>,
    #[serde(default)]
    kinds: HashMap<String, KindConfig>,
}

/// Per-kind config entry. Overrides a built-in rule field-by-field, or
/// defines a whole new kind (then `fields` is required).
#[derive(Deserialize, Debug)]
struct KindConfig {
    threshold: Option<u32>,
    fields: Option<Vec<String>>,
    combine: Option<Combine>,
    partition: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            std::process::exit(2);
        }
    };

    let result = match cli.command {
        Commands::Check { kind, list, fields, threshold, json } => {
            cmd_check(&kind, &list, &fields, threshold, json, &config, cli.quiet)
        }
        Commands::Compare { a, b, threshold, json } => {
            cmd_compare(&a, &b, threshold, json, &config)
        }
        Commands::Scan { kind, list, threshold, json } => {
            cmd_scan(&kind, &list, threshold, json, &config, cli.quiet)
        }
        Commands::Rules { json } => cmd_rules(json, &config),
    };

    match result {
        Ok(found) => {
            if found {
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            std::process::exit(2);
        }
    }
}

fn cmd_check(
    kind: &str,
    list: &Path,
    fields: &[String],
    threshold: Option<u32>,
    json: bool,
    config: &Config,
    quiet: bool,
) -> Result<bool, Box<dyn std::error::Error>> {
    let rule = resolve_rule(kind, config)?;
    let threshold = resolve_threshold(threshold, kind, config)?;
    let candidate = parse_fields(fields)?;
    let records = load_records(list)?;

    let start = Instant::now();
    let found = find_duplicate(&candidate, &records, &rule, threshold);
    let elapsed = start.elapsed();

    if json {
        let output = serde_json::json!({
            "kind": kind,
            "threshold": threshold,
            "checked": records.len(),
            "duplicate": found,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(found.is_some());
    }

    match found {
        Some(record) => {
            println!(
                "{} A similar record already exists: {}",
                "duplicate".yellow().bold(),
                record_label(record, &rule).cyan()
            );
        }
        None => {
            println!("{}", "No similar record found.".green());
        }
    }

    if !quiet {
        eprintln!(
            "Checked {} records in {:?} (threshold: {}%)",
            records.len(),
            elapsed,
            threshold
        );
    }

    Ok(found.is_some())
}

fn cmd_compare(
    a: &str,
    b: &str,
    threshold: Option<u32>,
    json: bool,
    config: &Config,
) -> Result<bool, Box<dyn std::error::Error>> {
    let threshold = match threshold.or(config.threshold) {
        Some(t) if t > 100 => return Err("threshold must be between 0 and 100".into()),
        Some(t) => t,
        None => DEFAULT_THRESHOLD,
    };

    let similarity = similarity_pct(a, b);
    let similar = is_similar(a, b, threshold);

    if json {
        let output = serde_json::json!({
            "a": a,
            "b": b,
            "similarity": similarity,
            "threshold": threshold,
            "similar": similar,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(false);
    }

    println!("Similarity: {}%", similarity.to_string().cyan().bold());
    if similar {
        println!("Verdict at threshold {}%: {}", threshold, "similar".yellow());
    } else {
        println!("Verdict at threshold {}%: {}", threshold, "distinct".green());
    }

    Ok(false)
}

fn cmd_scan(
    kind: &str,
    list: &Path,
    threshold: Option<u32>,
    json: bool,
    config: &Config,
    quiet: bool,
) -> Result<bool, Box<dyn std::error::Error>> {
    let rule = resolve_rule(kind, config)?;
    let threshold = resolve_threshold(threshold, kind, config)?;
    let records = load_records(list)?;

    let start = Instant::now();
    let mut pairs: Vec<(usize, usize, u32)> = Vec::new();

    for i in 0..records.len() {
        for j in (i + 1)..records.len() {
            if is_duplicate(&records[i], &records[j], &rule, threshold) {
                pairs.push((i, j, pair_score(&records[i], &records[j], &rule)));
            }
        }
    }

    let elapsed = start.elapsed();

    // Sort by score, highest first; index order breaks ties so output is stable
    pairs.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)).then(a.1.cmp(&b.1)));

    if json {
        let output: Vec<_> = pairs
            .iter()
            .map(|(i, j, score)| {
                serde_json::json!({
                    "score": score,
                    "record1": records[*i],
                    "record2": records[*j],
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(!pairs.is_empty());
    }

    if pairs.is_empty() {
        println!("{}", "No duplicates found above threshold.".green());
        if !quiet {
            eprintln!("Scanned {} records in {:?}", records.len(), elapsed);
        }
        return Ok(false);
    }

    println!(
        "{} duplicate pairs found (threshold: {}%)",
        pairs.len().to_string().yellow().bold(),
        threshold
    );
    if !quiet {
        eprintln!("Scanned {} records in {:?}\n", records.len(), elapsed);
    }

    for line in render_pairs(&pairs, &records, &rule) {
        println!("{}", line);
    }

    Ok(true)
}

/// Listing lines for confirmed duplicate pairs, capped at the display limit
/// with an overflow note for whatever does not fit.
fn render_pairs(pairs: &[(usize, usize, u32)], records: &[Value], rule: &MatchRule) -> Vec<String> {
    let mut lines: Vec<String> = pairs
        .iter()
        .take(SCAN_DISPLAY_LIMIT)
        .map(|(i, j, score)| {
            format!(
                "{}% {} {} {}",
                score.to_string().yellow(),
                record_label(&records[*i], rule).cyan(),
                "<->".dimmed(),
                record_label(&records[*j], rule)
            )
        })
        .collect();

    if pairs.len() > SCAN_DISPLAY_LIMIT {
        lines.push(format!(
            "\n{}",
            format!("... and {} more", pairs.len() - SCAN_DISPLAY_LIMIT).dimmed()
        ));
    }

    lines
}

fn cmd_rules(json: bool, config: &Config) -> Result<bool, Box<dyn std::error::Error>> {
    let builtin_count = builtin_rules().len();
    let mut kinds: Vec<String> = builtin_rules()
        .iter()
        .map(|(name, _)| name.to_string())
        .collect();
    for name in config.kinds.keys() {
        if !kinds.iter().any(|k| k == name) {
            kinds.push(name.clone());
        }
    }
    // Built-ins keep their order; config-only kinds come after, sorted
    kinds[builtin_count..].sort();

    if json {
        let mut output = serde_json::Map::new();
        for kind in &kinds {
            let rule = resolve_rule(kind, config)?;
            let threshold = resolve_threshold(None, kind, config)?;
            output.insert(
                kind.clone(),
                serde_json::json!({
                    "fields": rule.fields,
                    "combine": rule.combine,
                    "partition": rule.partition,
                    "threshold": threshold,
                }),
            );
        }
        println!("{}", serde_json::to_string_pretty(&Value::Object(output))?);
        return Ok(false);
    }

    println!("{}", "Match rules".green().bold());
    println!();

    for kind in &kinds {
        let rule = resolve_rule(kind, config)?;
        let threshold = resolve_threshold(None, kind, config)?;
        let partition = rule.partition.as_deref().unwrap_or("-");
        println!(
            "  {:<16} {:<4} of {:<34} partition: {:<14} threshold: {}%",
            kind.cyan(),
            rule.combine.to_string(),
            rule.fields.join(", "),
            partition,
            threshold.to_string().dimmed()
        );
    }

    Ok(false)
}

// Similarity scorer

/// Normalized Levenshtein ratio between two strings as an integer percentage,
/// after trimming and lower-casing. 100 means identical, 0 means unrelated.
/// Edit distance runs over the full strings, so a short string padded with
/// unrelated characters scores low even when it shares a prefix.
fn similarity_pct(a: &str, b: &str) -> u32 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    (strsim::normalized_levenshtein(&a, &b) * 100.0).round() as u32
}

/// True when two strings are close enough to count as the same identity.
/// Empty strings never match; exact equality (case- and whitespace-insensitive)
/// always matches regardless of threshold.
fn is_similar(a: &str, b: &str, threshold: u32) -> bool {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }
    similarity_pct(&a, &b) >= threshold
}

// Duplicate finder

/// Linear scan for the first existing record the candidate duplicates under
/// the given rule. First match in list order wins, not the best match.
fn find_duplicate<'a>(
    candidate: &Value,
    existing: &'a [Value],
    rule: &MatchRule,
    threshold: u32,
) -> Option<&'a Value> {
    existing
        .iter()
        .find(|record| is_duplicate(candidate, record, rule, threshold))
}

fn is_duplicate(candidate: &Value, record: &Value, rule: &MatchRule, threshold: u32) -> bool {
    // Hard partition: records of different kinds are never duplicates,
    // no matter how similar their names are.
    if let Some(partition) = &rule.partition {
        if candidate.get(partition) != record.get(partition) {
            return false;
        }
    }

    match rule.combine {
        Combine::Any => rule
            .fields
            .iter()
            .any(|f| field_matches(candidate, record, f, threshold)),
        Combine::All => rule
            .fields
            .iter()
            .all(|f| field_matches(candidate, record, f, threshold)),
    }
}

/// Missing or non-string fields on either side simply fail to match.
fn field_matches(candidate: &Value, record: &Value, field: &str, threshold: u32) -> bool {
    match (field_str(candidate, field), field_str(record, field)) {
        (Some(a), Some(b)) => is_similar(a, b, threshold),
        _ => false,
    }
}

fn field_str<'a>(record: &'a Value, field: &str) -> Option<&'a str> {
    record.get(field).and_then(Value::as_str)
}

/// Best per-field similarity for a confirmed duplicate pair, for display.
fn pair_score(a: &Value, b: &Value, rule: &MatchRule) -> u32 {
    rule.fields
        .iter()
        .filter_map(|f| match (field_str(a, f), field_str(b, f)) {
            (Some(x), Some(y)) => Some(similarity_pct(x, y)),
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

/// Human label for a record in conflict messages: the first non-empty
/// identity field, with a second field or the partition value as detail.
fn record_label(record: &Value, rule: &MatchRule) -> String {
    let mut values = rule
        .fields
        .iter()
        .filter_map(|f| field_str(record, f))
        .filter(|s| !s.trim().is_empty());

    let name = match values.next() {
        Some(name) => name,
        None => return "(unnamed record)".to_string(),
    };

    let detail = values
        .next()
        .or_else(|| rule.partition.as_deref().and_then(|p| field_str(record, p)));

    match detail {
        Some(detail) => format!("\"{}\" ({})", name, detail),
        None => format!("\"{}\"", name),
    }
}

// Rules and config

fn builtin_rules() -> Vec<(&'static str, MatchRule)> {
    // Field names follow the record shape the platform's list endpoints
    // actually return; config can remap them for other schemas.
    vec![
        (
            "currency",
            MatchRule {
                fields: vec!["nombre".to_string(), "codigo_iso".to_string()],
                combine: Combine::Any,
                partition: Some("tipo_moneda".to_string()),
            },
        ),
        (
            "payment-method",
            MatchRule {
                fields: vec!["nombre_metodo".to_string()],
                combine: Combine::All,
                partition: Some("tipo_metodo".to_string()),
            },
        ),
        (
            "tax-type",
            MatchRule {
                fields: vec!["nombre_impuesto".to_string(), "codigo_impuesto".to_string()],
                combine: Combine::Any,
                partition: None,
            },
        ),
    ]
}

/// Built-in rule for the kind, overridden field-by-field by config; a kind
/// only present in config must list its fields. An empty partition string
/// in config clears a built-in partition.
fn resolve_rule(kind: &str, config: &Config) -> Result<MatchRule, Box<dyn std::error::Error>> {
    let builtin = builtin_rules()
        .into_iter()
        .find(|(name, _)| *name == kind)
        .map(|(_, rule)| rule);

    match (builtin, config.kinds.get(kind)) {
        (Some(mut rule), Some(kc)) => {
            if let Some(fields) = &kc.fields {
                rule.fields = fields.clone();
            }
            if let Some(combine) = kc.combine {
                rule.combine = combine;
            }
            if let Some(partition) = &kc.partition {
                rule.partition = if partition.is_empty() {
                    None
                } else {
                    Some(partition.clone())
                };
            }
            Ok(rule)
        }
        (Some(rule), None) => Ok(rule),
        (None, Some(kc)) => {
            let fields = kc
                .fields
                .clone()
                .ok_or_else(|| format!("kind '{}' in config must list its fields", kind))?;
            let partition = kc.partition.clone().filter(|p| !p.is_empty());
            Ok(MatchRule {
                fields,
                combine: kc.combine.unwrap_or(Combine::Any),
                partition,
            })
        }
        (None, None) => {
            let known: Vec<String> = builtin_rules()
                .iter()
                .map(|(name, _)| name.to_string())
                .chain(config.kinds.keys().cloned())
                .collect();
            Err(format!("unknown kind '{}'. Known kinds: {}", kind, known.join(", ")).into())
        }
    }
}

/// CLI flag beats per-kind config beats global config beats the default.
fn resolve_threshold(
    flag: Option<u32>,
    kind: &str,
    config: &Config,
) -> Result<u32, Box<dyn std::error::Error>> {
    let threshold = flag
        .or_else(|| config.kinds.get(kind).and_then(|k| k.threshold))
        .or(config.threshold)
        .unwrap_or(DEFAULT_THRESHOLD);

    if threshold > 100 {
        return Err("threshold must be between 0 and 100".into());
    }
    Ok(threshold)
}

fn load_config(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    match fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content)
            .map_err(|e| format!("invalid config {}: {}", path.display(), e).into()),
        // Missing config is fine, defaults apply
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Config::default()),
        Err(e) => Err(format!("cannot read config {}: {}", path.display(), e).into()),
    }
}

// Record input

fn load_records(path: &Path) -> Result<Vec<Value>, Box<dyn std::error::Error>> {
    let content = if path == Path::new("-") {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?
    };

    let value: Value = serde_json::from_str(&content)
        .map_err(|e| format!("invalid JSON in record list: {}", e))?;
    unwrap_records(value)
}

/// List endpoints answer either with a bare array or with a paginated
/// envelope carrying a `results` array. Normalize both into a flat list.
fn unwrap_records(value: Value) -> Result<Vec<Value>, Box<dyn std::error::Error>> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("results") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err("expected a JSON array or an object with a 'results' array".into()),
        },
        _ => Err("expected a JSON array or an object with a 'results' array".into()),
    }
}

/// Build a candidate record from repeated name=value flags.
fn parse_fields(fields: &[String]) -> Result<Value, Box<dyn std::error::Error>> {
    if fields.is_empty() {
        return Err("no candidate fields given (use --field name=value)".into());
    }

    let mut map = serde_json::Map::new();
    for field in fields {
        let (name, value) = field
            .split_once('=')
            .ok_or_else(|| format!("invalid field '{}' (expected name=value)", field))?;
        map.insert(name.to_string(), Value::String(value.to_string()));
    }
    Ok(Value::Object(map))
}
