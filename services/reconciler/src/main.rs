//! Reconciler Service - Turns stored transcriptions into the merged batch dataset
//!
//! Responsibilities:
//! - Parse each image's CSV transcription payload into a cell grid
//! - Maintain the running column schema across the batch
//! - Count per-row confidence flags before any cleaning touches the cells
//! - Resolve Spanish date labels into calendar dates for the weigh-in columns
//! - Canonicalize animal identifiers and left-merge against the reference workbook
//! - Export one reconciled table per image plus the consolidated batch file
//!
//! CRITICAL: This service must be DETERMINISTIC
//! Same transcriptions + same reference workbook = same output

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::{Datelike, NaiveDate};
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Substring that marks a header row as genuine (case-insensitive). Data rows
/// that drift into the header position never contain it.
const SCHEMA_SENTINEL: &str = "vaca";

/// Canonical column names of the reconciled output.
const ID_COLUMN: &str = "Número animal";
const PARTURITION_COLUMN: &str = "Fecha Parto";
const MEASUREMENT_COLUMN: &str = "Kg/Leche";
const DATE_COLUMN_PREFIX: &str = "Fecha";
const FLAG_COLUMN: &str = "flag_count";

/// Accepted header spellings in the reference workbook, matched after
/// trimming and lowercasing (explicit, not inferred).
const REFERENCE_ID_COLUMNS: &[&str] = &["número animal", "numero animal", "vaca"];
const REFERENCE_DATE_COLUMNS: &[&str] = &["fecha parto", "fecha de parto"];

/// How many leading workbook rows may precede the header row.
const REFERENCE_HEADER_SCAN_ROWS: usize = 10;

#[derive(Parser, Debug)]
#[command(name = "reconciler", about = "Reconciles transcriptions against the reference workbook")]
struct Args {
    /// Batch identifier (MM_YYYY_N)
    #[arg(long)]
    batch_id: String,

    /// Path to a JSON settings file (defaults apply when omitted)
    #[arg(long)]
    config: Option<String>,

    /// Dry run - process the batch but don't write output files
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

// =============================================================================
// SETTINGS
// =============================================================================

/// Data settings, loadable from a JSON file. Every field has a default so a
/// partial file only overrides what it names.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct Settings {
    /// Resolution year override; the batch id's year applies when absent.
    year: Option<i32>,
    /// Half-open positional range of the measurement columns in the schema.
    measurement_band: (usize, usize),
    /// Literal character the extraction service appends to low-confidence cells.
    flag_marker: char,
    /// Sentinel written where no reference match exists.
    null_marker: String,
    /// Identifier separator as transcribed / as the reference table writes it.
    old_separator: char,
    new_separator: char,
    /// Known-noise columns dropped from the output when present.
    drop_columns: Vec<String>,
    /// Filename pattern of the reference workbook inside the batch directory.
    reference_pattern: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            year: None,
            measurement_band: (3, 10),
            flag_marker: '*',
            null_marker: "X*".to_string(),
            old_separator: '-',
            new_separator: '/',
            drop_columns: vec![
                "Nombre".to_string(),
                "Becerro".to_string(),
                "Fecha PP".to_string(),
                "#".to_string(),
            ],
            reference_pattern: "*.xlsx".to_string(),
        }
    }
}

fn load_settings(path: Option<&str>) -> Result<Settings> {
    match path {
        Some(p) => {
            let content = std::fs::read_to_string(p)
                .with_context(|| format!("cannot read settings file {p}"))?;
            serde_json::from_str(&content).with_context(|| format!("invalid settings file {p}"))
        }
        None => Ok(Settings::default()),
    }
}

// =============================================================================
// ERROR TAXONOMY
// =============================================================================

/// Every way the pipeline can fail on real data. Batch-fatal kinds propagate
/// out of the processing loop; the rest skip the offending image only.
#[derive(Debug, Error)]
enum PipelineError {
    #[error("empty transcription: no parseable rows in payload")]
    EmptyTranscription,

    #[error("no valid header row seen; cannot establish column schema (candidate: {candidate:?})")]
    NoSchema { candidate: Vec<String> },

    #[error("cannot resolve date label '{label}': {reason}")]
    DateResolution { label: String, reason: String },

    #[error("row has {cells} cells but schema has {columns} columns: {row:?}")]
    RowShape {
        cells: usize,
        columns: usize,
        row: Vec<String>,
    },

    #[error("merge structure invalid: {0}")]
    MergeStructure(String),
}

impl PipelineError {
    /// Whether the error poisons the whole batch rather than one image.
    fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::NoSchema { .. } | PipelineError::MergeStructure(..)
        )
    }
}

// =============================================================================
// BATCH IDENTIFIER
// =============================================================================

/// Parse a `MM_YYYY_N` batch id into (month, year, sequence number). The month
/// doubles as the resolution hint for date labels that omit their month.
fn parse_batch_id(batch_id: &str) -> Result<(u32, i32, u32)> {
    let parts: Vec<&str> = batch_id.split('_').collect();
    if parts.len() != 3 {
        anyhow::bail!("invalid batch id '{batch_id}': expected MM_YYYY_N");
    }

    let month: u32 = parts[0]
        .parse()
        .with_context(|| format!("invalid month in batch id '{batch_id}'"))?;
    let year: i32 = parts[1]
        .parse()
        .with_context(|| format!("invalid year in batch id '{batch_id}'"))?;
    let seq: u32 = parts[2]
        .parse()
        .with_context(|| format!("invalid sequence in batch id '{batch_id}'"))?;

    if !(1..=12).contains(&month) {
        anyhow::bail!("invalid batch id '{batch_id}': month {month} out of range");
    }
    if !(2000..=2100).contains(&year) {
        anyhow::bail!("invalid batch id '{batch_id}': year {year} out of range");
    }

    Ok((month, year, seq))
}

// =============================================================================
// CSV-BLOCK PARSER
// =============================================================================

/// Parse the bracket-delimited payload into a grid of string cells. Standard
/// CSV quoting is honored; field counts may differ between rows (that is a
/// known failure mode detected later, not silently truncated here). An empty
/// payload yields an empty grid.
fn parse_csv_block(payload: &str) -> Vec<Vec<String>> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(trimmed.as_bytes());

    let mut grid = Vec::new();
    for (line_num, result) in reader.records().enumerate() {
        match result {
            Ok(record) => grid.push(record.iter().map(|f| f.to_string()).collect()),
            Err(e) => {
                warn!(line = line_num + 1, error = %e, "skipping unparseable payload line");
            }
        }
    }

    grid
}

// =============================================================================
// DATE-LABEL NORMALIZER
// =============================================================================
// Sheet columns carry labels like "Mar Lun 03" (month, weekday, day) or
// "Lun 03" (weekday, day - the month comes from the batch id). Abbreviations
// are expanded against explicit Spanish name tables; process-locale state is
// never touched.
// =============================================================================

const WEEKDAY_ABBREVIATIONS: &[(&str, &str)] = &[
    ("Lun", "Lunes"),
    ("Mar", "Martes"),
    ("Mié", "Miércoles"),
    ("Mie", "Miércoles"),
    ("Jue", "Jueves"),
    ("Vie", "Viernes"),
    ("Sáb", "Sábado"),
    ("Sab", "Sábado"),
    ("Dom", "Domingo"),
];

// "Apr" and "Aug" show up when the model anglicizes an abbreviation; both
// spellings resolve to the Spanish month.
const MONTH_ABBREVIATIONS: &[(&str, &str)] = &[
    ("Ene", "Enero"),
    ("Feb", "Febrero"),
    ("Mar", "Marzo"),
    ("Abr", "Abril"),
    ("Apr", "Abril"),
    ("May", "Mayo"),
    ("Jun", "Junio"),
    ("Jul", "Julio"),
    ("Ago", "Agosto"),
    ("Aug", "Agosto"),
    ("Sep", "Septiembre"),
    ("Oct", "Octubre"),
    ("Nov", "Noviembre"),
    ("Dic", "Diciembre"),
];

const SPANISH_MONTHS: [&str; 12] = [
    "Enero",
    "Febrero",
    "Marzo",
    "Abril",
    "Mayo",
    "Junio",
    "Julio",
    "Agosto",
    "Septiembre",
    "Octubre",
    "Noviembre",
    "Diciembre",
];

/// Indexed by `chrono::Weekday::num_days_from_monday()`.
const SPANISH_WEEKDAYS: [&str; 7] = [
    "Lunes",
    "Martes",
    "Miércoles",
    "Jueves",
    "Viernes",
    "Sábado",
    "Domingo",
];

/// Title-case every whitespace-delimited word ("mar lun 03" -> "Mar Lun 03").
fn title_case(input: &str) -> String {
    input
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Expand an abbreviation by its leading three characters; unmatched tokens
/// pass through unchanged.
fn expand_abbreviation(token: &str, table: &[(&str, &str)]) -> String {
    let prefix: String = token.chars().take(3).collect();
    table
        .iter()
        .find(|(abbr, _)| *abbr == prefix)
        .map(|(_, full)| full.to_string())
        .unwrap_or_else(|| token.to_string())
}

/// Normalize a raw column label into full-name tokens. A three-token label is
/// `<Month> <Weekday> <Day>`; a two-token label is `<Weekday> <Day>`. Any
/// other layout passes through untouched and fails at resolution.
fn normalize_label(label: &str) -> Vec<String> {
    let mut tokens: Vec<String> = title_case(label)
        .split_whitespace()
        .map(|t| t.to_string())
        .collect();

    if tokens.len() >= 3 {
        tokens[0] = expand_abbreviation(&tokens[0], MONTH_ABBREVIATIONS);
        tokens[1] = expand_abbreviation(&tokens[1], WEEKDAY_ABBREVIATIONS);
    } else if tokens.len() == 2 {
        tokens[0] = expand_abbreviation(&tokens[0], WEEKDAY_ABBREVIATIONS);
    }

    tokens
}

fn month_number(name: &str) -> Option<u32> {
    SPANISH_MONTHS
        .iter()
        .position(|m| *m == name)
        .map(|i| i as u32 + 1)
}

/// 0 = Monday .. 6 = Sunday, aligned with `num_days_from_monday`.
fn weekday_index(name: &str) -> Option<usize> {
    SPANISH_WEEKDAYS.iter().position(|d| *d == name)
}

fn date_error(label: &str, reason: impl Into<String>) -> PipelineError {
    PipelineError::DateResolution {
        label: label.to_string(),
        reason: reason.into(),
    }
}

/// Resolve a raw column label to a calendar date. The stated weekday must
/// agree with the actual weekday of the resolved (day, month, year); a
/// disagreement means the transcription and the calendar cannot both be
/// right, so the record is not built.
fn resolve_date_label(
    label: &str,
    year: i32,
    batch_month: u32,
) -> Result<NaiveDate, PipelineError> {
    let cleaned = label.replace('.', "");
    let tokens = normalize_label(&cleaned);

    let (month, weekday, day_token) = match tokens.len() {
        n if n >= 3 => {
            let month = month_number(&tokens[0])
                .ok_or_else(|| date_error(label, format!("unknown month '{}'", tokens[0])))?;
            let weekday = weekday_index(&tokens[1])
                .ok_or_else(|| date_error(label, format!("unknown weekday '{}'", tokens[1])))?;
            (month, weekday, tokens[2].as_str())
        }
        2 => {
            let weekday = weekday_index(&tokens[0])
                .ok_or_else(|| date_error(label, format!("unknown weekday '{}'", tokens[0])))?;
            (batch_month, weekday, tokens[1].as_str())
        }
        _ => return Err(date_error(label, "unrecognized label layout")),
    };

    let day: u32 = day_token
        .parse()
        .map_err(|_| date_error(label, format!("invalid day number '{day_token}'")))?;

    let date = NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| date_error(label, format!("day {day}/month {month} out of range")))?;

    let actual = date.weekday().num_days_from_monday() as usize;
    if actual != weekday {
        return Err(date_error(
            label,
            format!(
                "label says {} but {} is a {}",
                SPANISH_WEEKDAYS[weekday],
                render_date(date),
                SPANISH_WEEKDAYS[actual]
            ),
        ));
    }

    Ok(date)
}

/// Render day/month/year with no leading zeros ("3/3/2025"). Both the date
/// columns and the reference loader use this, so merge-adjacent dates always
/// compare in one format.
fn render_date(date: NaiveDate) -> String {
    format!("{}/{}/{}", date.day(), date.month(), date.year())
}

fn convert_label_to_date(
    label: &str,
    year: i32,
    batch_month: u32,
) -> Result<String, PipelineError> {
    resolve_date_label(label, year, batch_month).map(render_date)
}

// =============================================================================
// SCHEMA TRACKER
// =============================================================================

/// A header row is genuine when any entry carries the sentinel marker.
fn header_is_valid(row: &[String]) -> bool {
    row.iter()
        .any(|cell| cell.to_lowercase().contains(SCHEMA_SENTINEL))
}

/// Running column schema for a batch. The first valid header row is adopted;
/// later header rows replace it only when valid AND different, which tolerates
/// transcription jitter re-emitting near-identical headers.
#[derive(Debug, Default)]
struct SchemaTracker {
    current: Vec<String>,
}

impl SchemaTracker {
    fn new() -> Self {
        Self::default()
    }

    fn update(&mut self, candidate: &[String]) -> Result<&[String], PipelineError> {
        if self.current.is_empty() {
            if !header_is_valid(candidate) {
                return Err(PipelineError::NoSchema {
                    candidate: candidate.to_vec(),
                });
            }
            self.current = candidate.to_vec();
            info!(columns = ?self.current, "schema adopted");
        } else if header_is_valid(candidate) && self.current != candidate {
            self.current = candidate.to_vec();
            info!(columns = ?self.current, "schema replaced");
        } else {
            debug!(columns = ?self.current, "schema retained");
        }

        Ok(&self.current)
    }
}

// =============================================================================
// ROW FLAG COUNTER
// =============================================================================

/// Total flag markers across a row's raw cells. Must run before cleaning
/// strips marker characters.
fn count_row_flags(row: &[String], marker: char) -> usize {
    row.iter()
        .map(|cell| cell.chars().filter(|&c| c == marker).count())
        .sum()
}

// =============================================================================
// RECORD BUILDER
// =============================================================================

/// One dated measurement taken from a weigh-in column.
#[derive(Debug, Clone, PartialEq)]
struct WeighIn {
    date: String,
    value: String,
}

/// One animal's reconciliation input from one image. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
struct AnimalRecord {
    animal_id: String,
    weigh_ins: Vec<WeighIn>,
    flag_count: usize,
    /// Surviving columns outside the measurement band and the drop list.
    extras: Vec<(String, String)>,
}

/// Strip the `-*` sequence and any lone separator from a measurement cell.
/// Flag markers not adjacent to a separator survive cleaning: the flag stays
/// visible in the exported value.
fn clean_cell_value(value: &str, marker: char, separator: char) -> String {
    let flagged_separator: String = [separator, marker].iter().collect();
    value
        .replace(&flagged_separator, "")
        .replace(separator, "")
}

fn canonicalize_identifier(raw: &str, old: char, new: char) -> String {
    raw.trim().replace(old, &new.to_string())
}

/// Build records from a grid's data rows under the active schema. Pure over a
/// snapshot of the schema: the band positions and their date labels are fixed
/// up front, never re-derived while assembling output.
fn build_records(
    rows: &[Vec<String>],
    schema: &[String],
    settings: &Settings,
    year: i32,
    batch_month: u32,
) -> Result<Vec<AnimalRecord>, PipelineError> {
    let (band_start, band_end) = settings.measurement_band;
    let band = band_start..band_end.min(schema.len());

    // Resolve every band column's date once, left to right. A label that
    // doesn't resolve aborts the whole image before any record is built.
    let mut dated_columns: Vec<(usize, String)> = Vec::new();
    for idx in band.clone() {
        let date = convert_label_to_date(&schema[idx], year, batch_month)?;
        dated_columns.push((idx, date));
    }

    let dropped: Vec<String> = settings
        .drop_columns
        .iter()
        .map(|c| c.to_lowercase())
        .collect();
    let is_dropped = |name: &str| dropped.contains(&name.trim().to_lowercase());

    // The identifier is the first surviving column outside the band.
    let id_col = schema
        .iter()
        .enumerate()
        .find(|(i, name)| !band.contains(i) && !is_dropped(name.as_str()))
        .map(|(i, _)| i)
        .ok_or_else(|| {
            PipelineError::MergeStructure(format!(
                "schema has no identifier column outside band {band_start}..{}: {schema:?}",
                band.end
            ))
        })?;

    let mut records = Vec::with_capacity(rows.len());

    for row in rows {
        if row.len() > schema.len() {
            return Err(PipelineError::RowShape {
                cells: row.len(),
                columns: schema.len(),
                row: row.clone(),
            });
        }

        let mut cells = row.clone();
        if cells.len() < schema.len() {
            warn!(
                cells = cells.len(),
                columns = schema.len(),
                row = ?row,
                "short row padded with empty cells"
            );
            cells.resize(schema.len(), String::new());
        }

        // Flags counted on raw values, before cleaning strips anything.
        let flag_count = count_row_flags(&cells, settings.flag_marker);

        let weigh_ins = dated_columns
            .iter()
            .map(|(idx, date)| WeighIn {
                date: date.clone(),
                value: clean_cell_value(&cells[*idx], settings.flag_marker, settings.old_separator),
            })
            .collect();

        let animal_id = canonicalize_identifier(
            &cells[id_col],
            settings.old_separator,
            settings.new_separator,
        );

        let extras = schema
            .iter()
            .enumerate()
            .filter(|(i, name)| *i != id_col && !band.contains(i) && !is_dropped(name.as_str()))
            .map(|(i, name)| (name.clone(), cells[i].clone()))
            .collect();

        records.push(AnimalRecord {
            animal_id,
            weigh_ins,
            flag_count,
            extras,
        });
    }

    Ok(records)
}

// =============================================================================
// REFERENCE TABLE
// =============================================================================

/// Authoritative parturition date per animal, loaded once per batch.
#[derive(Debug)]
struct ReferenceTable {
    entries: HashMap<String, String>,
}

impl ReferenceTable {
    fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    fn lookup(&self, animal_id: &str) -> Option<&String> {
        self.entries.get(animal_id)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Find a column index by matching against known header spellings.
fn find_column(headers: &[String], candidates: &[&str]) -> Option<usize> {
    headers.iter().position(|header| {
        let normalized = header.trim().to_lowercase();
        candidates
            .iter()
            .any(|c| normalized == *c || normalized.contains(c))
    })
}

/// Scan the workbook's leading rows for the header row and return
/// (header row, identifier column, date column).
fn locate_reference_header(rows: &[Vec<String>]) -> Result<(usize, usize, usize), PipelineError> {
    for (row_idx, row) in rows.iter().take(REFERENCE_HEADER_SCAN_ROWS).enumerate() {
        if let (Some(id_col), Some(date_col)) = (
            find_column(row, REFERENCE_ID_COLUMNS),
            find_column(row, REFERENCE_DATE_COLUMNS),
        ) {
            return Ok((row_idx, id_col, date_col));
        }
    }

    Err(PipelineError::MergeStructure(format!(
        "reference workbook has no header row with both an identifier column \
         ({REFERENCE_ID_COLUMNS:?}) and a date column ({REFERENCE_DATE_COLUMNS:?})"
    )))
}

/// Stringify one workbook cell. Excel datetimes render in the same
/// day/month/year form the date normalizer emits.
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|ndt| render_date(ndt.date()))
            .unwrap_or_default(),
        Data::DateTimeIso(s) => NaiveDate::parse_from_str(&s[..s.len().min(10)], "%Y-%m-%d")
            .map(render_date)
            .unwrap_or_else(|_| s.trim().to_string()),
        Data::Empty => String::new(),
        other => format!("{other}"),
    }
}

/// Extract (identifier, date) pairs from stringified workbook rows below the
/// header. Rows missing either value are dropped; duplicate identifiers keep
/// their first occurrence.
fn reference_entries_from_rows(
    rows: &[Vec<String>],
    settings: &Settings,
) -> Result<ReferenceTable, PipelineError> {
    let (header_row, id_col, date_col) = locate_reference_header(rows)?;

    let mut entries: HashMap<String, String> = HashMap::new();
    for row in rows.iter().skip(header_row + 1) {
        let raw_id = row.get(id_col).map(String::as_str).unwrap_or("");
        let date = row.get(date_col).map(String::as_str).unwrap_or("");
        if raw_id.is_empty() || date.is_empty() {
            continue;
        }

        let animal_id = canonicalize_identifier(
            raw_id,
            settings.old_separator,
            settings.new_separator,
        );

        if entries.contains_key(&animal_id) {
            warn!(animal_id = %animal_id, "duplicate identifier in reference workbook, keeping first");
            continue;
        }
        entries.insert(animal_id, date.to_string());
    }

    Ok(ReferenceTable::new(entries))
}

/// Open the reference workbook and load its first sheet.
fn load_reference_table(path: &Path, settings: &Settings) -> Result<ReferenceTable> {
    info!(file = %path.display(), "loading reference workbook");

    let mut workbook = open_workbook_auto(path)
        .with_context(|| format!("cannot open reference workbook {}", path.display()))?;

    let sheet_names = workbook.sheet_names().to_vec();
    let sheet_name = sheet_names
        .first()
        .context("reference workbook has no sheets")?
        .clone();

    let range = workbook
        .worksheet_range(&sheet_name)
        .with_context(|| format!("cannot read sheet '{sheet_name}'"))?;

    let rows: Vec<Vec<String>> = range
        .rows()
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect();

    let table = reference_entries_from_rows(&rows, settings)?;
    info!(entries = table.len(), sheet = %sheet_name, "reference table loaded");
    Ok(table)
}

/// Find the workbook matching the settings pattern ("*.xlsx") inside the
/// batch's reference directory. Lexicographically first match wins.
fn find_reference_file(dir: &Path, pattern: &str) -> Result<PathBuf> {
    let suffix = pattern.trim_start_matches('*').to_lowercase();

    let mut matches: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read reference directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.to_lowercase().ends_with(&suffix))
                .unwrap_or(false)
        })
        .collect();
    matches.sort();

    matches.into_iter().next().with_context(|| {
        format!(
            "no reference workbook matching '{pattern}' in {}",
            dir.display()
        )
    })
}

// =============================================================================
// RECONCILER
// =============================================================================

/// One animal's fully reconciled row.
#[derive(Debug, Clone, PartialEq)]
struct ReconciledRecord {
    animal_id: String,
    parturition_date: String,
    weigh_ins: Vec<WeighIn>,
    flag_count: usize,
    extras: Vec<(String, String)>,
}

/// Left-merge built records against the reference table. Every record is
/// retained; an identifier without a reference row gets the null marker as
/// its authoritative date. Cardinality is one output row per input row.
fn reconcile(
    records: Vec<AnimalRecord>,
    reference: &ReferenceTable,
    null_marker: &str,
) -> Vec<ReconciledRecord> {
    let mut unmatched = 0;

    let reconciled: Vec<ReconciledRecord> = records
        .into_iter()
        .map(|record| {
            let parturition_date = match reference.lookup(&record.animal_id) {
                Some(date) => date.clone(),
                None => {
                    unmatched += 1;
                    null_marker.to_string()
                }
            };
            ReconciledRecord {
                animal_id: record.animal_id,
                parturition_date,
                weigh_ins: record.weigh_ins,
                flag_count: record.flag_count,
                extras: record.extras,
            }
        })
        .collect();

    if unmatched > 0 {
        info!(
            unmatched,
            total = reconciled.len(),
            "identifiers without reference match"
        );
    }

    reconciled
}

// =============================================================================
// OUTPUT TABLES
// =============================================================================

/// One exported table per source image.
#[derive(Debug, Clone, PartialEq)]
struct ImageTable {
    source: String,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// Render reconciled records as a flat table: identifier and authoritative
/// date lead, then the date/measurement pairs in band order, then surviving
/// passthrough columns, then the flag count.
fn render_table(source: &str, records: &[ReconciledRecord]) -> ImageTable {
    let mut headers = vec![ID_COLUMN.to_string(), PARTURITION_COLUMN.to_string()];
    if let Some(first) = records.first() {
        for n in 1..=first.weigh_ins.len() {
            headers.push(format!("{DATE_COLUMN_PREFIX} {n}"));
            headers.push(MEASUREMENT_COLUMN.to_string());
        }
        for (name, _) in &first.extras {
            headers.push(name.clone());
        }
    }
    headers.push(FLAG_COLUMN.to_string());

    let rows = records
        .iter()
        .map(|record| {
            let mut row = vec![record.animal_id.clone(), record.parturition_date.clone()];
            for weigh_in in &record.weigh_ins {
                row.push(weigh_in.date.clone());
                row.push(weigh_in.value.clone());
            }
            for (_, value) in &record.extras {
                row.push(value.clone());
            }
            row.push(record.flag_count.to_string());
            row
        })
        .collect();

    ImageTable {
        source: source.to_string(),
        headers,
        rows,
    }
}

// =============================================================================
// SINK - per-image CSVs plus the consolidated batch file
// =============================================================================

fn export_batch(batch: &[ImageTable], output_dir: &Path, batch_id: &str) -> Result<usize> {
    if batch.is_empty() {
        return Ok(0);
    }

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("cannot create output directory {}", output_dir.display()))?;

    let mut written = 0;
    for table in batch {
        let path = output_dir.join(format!("{}.csv", table.source));
        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("cannot write {}", path.display()))?;
        writer.write_record(&table.headers)?;
        for row in &table.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        written += 1;
    }

    // The consolidated file takes its column layout from the first table; a
    // table whose headers diverged (schema replacement mid-batch) keeps its
    // per-image file but is excluded here rather than written misaligned.
    let reference_headers = &batch[0].headers;
    let consolidated_path = output_dir.join(format!("{batch_id}_consolidado.csv"));
    let mut writer = csv::Writer::from_path(&consolidated_path)
        .with_context(|| format!("cannot write {}", consolidated_path.display()))?;

    let mut header_row = vec!["Imagen".to_string()];
    header_row.extend(reference_headers.iter().cloned());
    writer.write_record(&header_row)?;

    for table in batch {
        if &table.headers != reference_headers {
            warn!(
                source = %table.source,
                "column layout differs from batch layout, excluded from consolidated file"
            );
            continue;
        }
        for row in &table.rows {
            let mut record = vec![table.source.clone()];
            record.extend(row.iter().cloned());
            writer.write_record(&record)?;
        }
    }
    writer.flush()?;
    written += 1;

    Ok(written)
}

// =============================================================================
// BATCH LOOP
// =============================================================================

/// Run one transcription payload through the full pipeline.
fn process_payload(
    payload: &str,
    tracker: &mut SchemaTracker,
    reference: &ReferenceTable,
    settings: &Settings,
    year: i32,
    batch_month: u32,
) -> Result<Vec<ReconciledRecord>, PipelineError> {
    let grid = parse_csv_block(payload);
    if grid.is_empty() {
        return Err(PipelineError::EmptyTranscription);
    }

    let schema = tracker.update(&grid[0])?.to_vec();
    let records = build_records(&grid[1..], &schema, settings, year, batch_month)?;

    Ok(reconcile(records, reference, &settings.null_marker))
}

/// List a batch's transcription payloads in lexicographic order.
fn list_transcriptions(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut payloads: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case("txt"))
                    .unwrap_or(false)
            })
            .collect(),
        // A missing directory is the same as an empty batch.
        Err(_) => Vec::new(),
    };

    payloads.sort();
    Ok(payloads)
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let args = Args::parse();
    let settings = load_settings(args.config.as_deref())?;

    let (batch_month, batch_year, _seq) = parse_batch_id(&args.batch_id)?;
    let year = settings.year.unwrap_or(batch_year);

    let data_root =
        PathBuf::from(std::env::var("DATA_ROOT").unwrap_or_else(|_| "./data".to_string()));
    let batch_dir = data_root.join(&args.batch_id);
    let transcriptions_dir = batch_dir.join("transcriptions");
    let reference_dir = batch_dir.join("reference");
    let output_dir = batch_dir.join("output");

    println!("=== Registro Lechero Reconciler ===");
    println!("Batch: {}", args.batch_id);
    println!("Year: {year} (month hint: {batch_month})");
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let reference_file = find_reference_file(&reference_dir, &settings.reference_pattern)?;
    let reference = load_reference_table(&reference_file, &settings)?;

    let transcriptions = list_transcriptions(&transcriptions_dir)?;
    println!("Found {} transcription(s)", transcriptions.len());

    let mut tracker = SchemaTracker::new();
    let mut batch: Vec<ImageTable> = Vec::new();
    let mut skipped = 0;
    let mut total_records = 0;

    for path in &transcriptions {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        info!(file = %file_name, "processing transcription");

        let payload = match std::fs::read_to_string(path) {
            Ok(p) => p,
            Err(e) => {
                error!(file = %file_name, error = %e, "cannot read payload, skipping image");
                skipped += 1;
                continue;
            }
        };

        match process_payload(
            &payload,
            &mut tracker,
            &reference,
            &settings,
            year,
            batch_month,
        ) {
            Ok(records) => {
                info!(file = %file_name, records = records.len(), "image reconciled");
                if records.is_empty() {
                    warn!(file = %file_name, "transcription produced no data rows");
                }
                total_records += records.len();
                batch.push(render_table(&stem, &records));
            }
            Err(e) if e.is_fatal() => {
                error!(file = %file_name, error = %e, "batch-fatal error");
                return Err(e.into());
            }
            Err(e) => {
                error!(file = %file_name, error = %e, "skipping image");
                skipped += 1;
            }
        }
    }

    let files_written = if args.dry_run {
        println!("\nDry run - no output files written");
        0
    } else {
        export_batch(&batch, &output_dir, &args.batch_id)?
    };

    println!("\n=== Reconciliation Summary ===");
    println!("Images reconciled: {}", batch.len());
    println!("Images skipped: {skipped}");
    println!("Records: {total_records}");
    println!("Reference entries: {}", reference.len());
    if files_written > 0 {
        println!("Output files: {files_written} in {}", output_dir.display());
    }

    Ok(())
}

// =============================================================================
// TESTS - Critical for ensuring DETERMINISM
// =============================================================================
