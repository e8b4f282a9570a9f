//! CSV export: filtered aggregates -> rows.
//!
//! Aggregates are fetched from storage one page at a time and encoded with
//! the same field map the importer reads, so an exported file imports back
//! to the same catalog. Neither the result set nor the output is held in
//! memory.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use tracing::{debug, info};

use crate::config::ImportConfig;
use crate::error::{ExportError, ExportResult};
use crate::mapping::FieldMap;
use crate::models::{AccessLevel, CatalogAggregate, ItemId};
use crate::storage::CatalogStore;
use crate::transform::codec::encode;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

// =============================================================================
// Filter
// =============================================================================

/// Export filter. Unset fields match everything; date bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportFilter {
    pub created_from: Option<NaiveDate>,
    pub created_to: Option<NaiveDate>,
    pub updated_from: Option<NaiveDate>,
    pub updated_to: Option<NaiveDate>,
    pub access_level: Option<AccessLevel>,
    /// Collection name, case-insensitive.
    pub collection: Option<String>,
    /// Language name, matched against any of the item's languages.
    pub language: Option<String>,
    pub is_active: Option<bool>,
    pub is_featured: Option<bool>,
    pub year_from: Option<i32>,
    pub year_to: Option<i32>,
}

fn within(date: NaiveDate, from: Option<NaiveDate>, to: Option<NaiveDate>) -> bool {
    from.map_or(true, |f| date >= f) && to.map_or(true, |t| date <= t)
}

impl ExportFilter {
    pub fn matches(&self, aggregate: &CatalogAggregate) -> bool {
        let item = &aggregate.item;
        let f = &item.fields;

        if !within(item.created_at.date_naive(), self.created_from, self.created_to)
            || !within(item.updated_at.date_naive(), self.updated_from, self.updated_to)
        {
            return false;
        }
        if self.access_level.is_some_and(|level| f.access_level != level)
            || self.is_active.is_some_and(|active| f.is_active != active)
            || self.is_featured.is_some_and(|featured| f.is_featured != featured)
        {
            return false;
        }
        if self.year_from.is_some() || self.year_to.is_some() {
            let Some(year) = f.publication_year else {
                return false;
            };
            if self.year_from.is_some_and(|y| year < y) || self.year_to.is_some_and(|y| year > y) {
                return false;
            }
        }
        if let Some(name) = &self.collection {
            let hit = aggregate
                .collection
                .as_ref()
                .is_some_and(|c| c.name.eq_ignore_ascii_case(name.trim()));
            if !hit {
                return false;
            }
        }
        if let Some(name) = &self.language {
            let hit = aggregate
                .languages
                .iter()
                .any(|l| l.language.name.eq_ignore_ascii_case(name.trim()));
            if !hit {
                return false;
            }
        }
        true
    }
}

// =============================================================================
// Options
// =============================================================================

/// Output options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    /// Column subset, in output order; the full field map when unset.
    pub columns: Option<Vec<String>>,
    /// Emit the `table.column` annotation row under the header.
    pub include_annotation: bool,
    /// Prefix the output with a UTF-8 byte-order mark.
    pub bom: bool,
}

/// What an export wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub rows: usize,
    pub columns: Vec<String>,
}

// =============================================================================
// Row stream
// =============================================================================

/// Lazily pages through storage, yielding one encoded row per aggregate.
pub struct RowStream<'a> {
    store: &'a dyn CatalogStore,
    filter: ExportFilter,
    headers: Vec<String>,
    map: &'a FieldMap,
    page_size: usize,
    cursor: Option<ItemId>,
    buffer: VecDeque<CatalogAggregate>,
    exhausted: bool,
}

impl<'a> RowStream<'a> {
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    fn fill(&mut self) -> ExportResult<()> {
        let page = self
            .store
            .query_aggregates(&self.filter, self.cursor, self.page_size)?;
        debug!(cursor = ?self.cursor, fetched = page.len(), "Fetched export page");
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.cursor = Some(last.item.id);
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for RowStream<'_> {
    type Item = ExportResult<Vec<String>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        self.buffer
            .pop_front()
            .map(|aggregate| Ok(encode(&aggregate, &self.headers, self.map)))
    }
}

// =============================================================================
// Exporter
// =============================================================================

/// Streams catalog aggregates as CSV.
#[derive(Debug, Clone)]
pub struct Exporter {
    map: FieldMap,
    page_size: usize,
}

impl Exporter {
    pub fn new(config: &ImportConfig) -> Self {
        Self {
            map: config.field_map.clone(),
            page_size: config.export_chunk_size,
        }
    }

    /// Resolve the output header: a validated subset or every mapped column.
    pub fn headers(&self, options: &ExportOptions) -> ExportResult<Vec<String>> {
        match &options.columns {
            None => Ok(self.map.columns()),
            Some(columns) => columns
                .iter()
                .map(|c| {
                    self.map
                        .entry_for_column(c)
                        .map(|e| e.column.clone())
                        .ok_or_else(|| ExportError::UnknownColumn(c.clone()))
                })
                .collect(),
        }
    }

    /// Row stream over every aggregate matching `filter`.
    pub fn stream<'a>(
        &'a self,
        store: &'a dyn CatalogStore,
        filter: &ExportFilter,
        options: &ExportOptions,
    ) -> ExportResult<RowStream<'a>> {
        Ok(RowStream {
            store,
            filter: filter.clone(),
            headers: self.headers(options)?,
            map: &self.map,
            page_size: self.page_size.max(1),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }

    /// Write the header (and annotation row if asked) without data.
    pub fn write_template<W: Write>(&self, options: &ExportOptions, out: W) -> ExportResult<Vec<String>> {
        let headers = self.headers(options)?;
        let mut writer = self.open_writer(options, out)?;
        self.write_preamble(&mut writer, &headers, options)?;
        writer.flush()?;
        Ok(headers)
    }

    /// Export matching aggregates as CSV.
    pub fn export<W: Write>(
        &self,
        store: &dyn CatalogStore,
        filter: &ExportFilter,
        options: &ExportOptions,
        out: W,
    ) -> ExportResult<ExportSummary> {
        let stream = self.stream(store, filter, options)?;
        let headers = stream.headers().to_vec();
        let mut writer = self.open_writer(options, out)?;
        self.write_preamble(&mut writer, &headers, options)?;

        let mut rows = 0;
        for row in stream {
            writer.write_record(&row?)?;
            rows += 1;
        }
        writer.flush()?;

        info!(rows, columns = headers.len(), "Export finished");
        Ok(ExportSummary { rows, columns: headers })
    }

    fn open_writer<W: Write>(&self, options: &ExportOptions, mut out: W) -> ExportResult<csv::Writer<W>> {
        if options.bom {
            out.write_all(UTF8_BOM)?;
        }
        Ok(csv::WriterBuilder::new().from_writer(out))
    }

    fn write_preamble<W: Write>(
        &self,
        writer: &mut csv::Writer<W>,
        headers: &[String],
        options: &ExportOptions,
    ) -> ExportResult<()> {
        writer.write_record(headers)?;
        if options.include_annotation {
            writer.write_record(self.map.annotation_row(headers))?;
        }
        Ok(())
    }
}
