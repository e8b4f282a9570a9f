//! CSV reading with encoding and delimiter auto-detection.
//!
//! Files are never loaded whole: encoding and delimiter are sniffed from a
//! bounded head sample, the byte stream is transcoded to UTF-8 on the fly, and
//! rows are handed out in fixed-size chunks by [`RowReader`].
//!
//! Blank rows (every cell empty after trimming) are skipped and counted. An
//! optional mapping-annotation row directly under the header is recognised by
//! [`is_mapping_annotation`] and skipped.

use encoding_rs::{CoderResult, Decoder, Encoding, UTF_8};
use regex::Regex;
use std::io::{self, Cursor, Read};
use std::path::PathBuf;

use crate::error::{CsvError, CsvResult};

/// Bytes inspected for encoding and delimiter detection.
pub const SAMPLE_SIZE: usize = 64 * 1024;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

// =============================================================================
// Sources
// =============================================================================

/// Where an import reads from. Sources can be opened more than once, which
/// lets the row count be established before processing starts.
#[derive(Debug, Clone)]
pub enum ImportSource {
    File(PathBuf),
    Bytes { name: String, data: Vec<u8> },
}

impl ImportSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        ImportSource::File(path.into())
    }

    pub fn bytes(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        ImportSource::Bytes {
            name: name.into(),
            data: data.into(),
        }
    }

    /// File name recorded on the import session.
    pub fn name(&self) -> String {
        match self {
            ImportSource::File(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string()),
            ImportSource::Bytes { name, .. } => name.clone(),
        }
    }

    /// Open a fresh raw byte stream.
    pub fn open(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        match self {
            ImportSource::File(path) => Ok(Box::new(io::BufReader::new(std::fs::File::open(path)?))),
            ImportSource::Bytes { data, .. } => Ok(Box::new(Cursor::new(data.as_slice()))),
        }
    }

    /// Read up to `limit` bytes from the start of the source.
    pub fn sample(&self, limit: usize) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(limit.min(SAMPLE_SIZE));
        self.open()?.take(limit as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Detect the encoding of a byte sample.
///
/// A UTF-8 BOM or a sample that is valid UTF-8 (allowing a character cut at
/// the end of the sample) wins outright; otherwise chardet decides.
pub fn detect_encoding(bytes: &[u8]) -> String {
    if bytes.starts_with(UTF8_BOM) {
        return "utf-8".to_string();
    }
    match std::str::from_utf8(bytes) {
        Ok(_) => return "utf-8".to_string(),
        Err(e) if e.error_len().is_none() => return "utf-8".to_string(),
        Err(_) => {}
    }

    let result = chardet::detect(bytes);
    let charset = result.0;

    match charset.to_lowercase().as_str() {
        "ascii" | "utf-8" | "utf8" | "utf-8-sig" => "utf-8".to_string(),
        "iso-8859-1" | "iso-8859-15" | "latin-1" | "latin1" => "iso-8859-15".to_string(),
        "windows-1252" | "cp1252" => "windows-1252".to_string(),
        "" => "utf-8".to_string(),
        other => other.to_string(),
    }
}

/// Resolve an encoding label, falling back to UTF-8 for unknown labels.
pub fn encoding_for_label(label: &str) -> &'static Encoding {
    Encoding::for_label(label.as_bytes()).unwrap_or(UTF_8)
}

/// Streams any supported encoding as UTF-8 and drops a leading BOM.
pub struct DecodingReader<R> {
    inner: R,
    decoder: Decoder,
    input: Vec<u8>,
    input_start: usize,
    input_end: usize,
    output: Vec<u8>,
    output_start: usize,
    output_end: usize,
    eof: bool,
    finished: bool,
}

impl<R: Read> DecodingReader<R> {
    pub fn new(inner: R, encoding: &'static Encoding) -> Self {
        Self {
            inner,
            decoder: encoding.new_decoder_with_bom_removal(),
            input: vec![0; 8 * 1024],
            input_start: 0,
            input_end: 0,
            output: vec![0; 32 * 1024],
            output_start: 0,
            output_end: 0,
            eof: false,
            finished: false,
        }
    }
}

impl<R: Read> Read for DecodingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.output_start < self.output_end {
                let n = buf.len().min(self.output_end - self.output_start);
                buf[..n].copy_from_slice(&self.output[self.output_start..self.output_start + n]);
                self.output_start += n;
                return Ok(n);
            }
            if self.finished {
                return Ok(0);
            }

            if self.input_start == self.input_end && !self.eof {
                let n = self.inner.read(&mut self.input)?;
                self.input_start = 0;
                self.input_end = n;
                if n == 0 {
                    self.eof = true;
                }
            }

            let (result, read, written, _) = self.decoder.decode_to_utf8(
                &self.input[self.input_start..self.input_end],
                &mut self.output,
                self.eof,
            );
            self.input_start += read;
            self.output_start = 0;
            self.output_end = written;

            if self.eof && result == CoderResult::InputEmpty {
                self.finished = true;
            }
        }
    }
}

// =============================================================================
// Delimiter
// =============================================================================

/// Detect the delimiter by counting occurrences in the first line.
///
/// `|` is never a candidate: it separates values inside a cell. Ties and
/// single-column headers resolve to a comma.
pub fn detect_delimiter(content: &str) -> u8 {
    let first_line = content.lines().next().unwrap_or("");

    let separators = [b',', b';', b'\t'];
    let mut best_sep = b',';
    let mut best_count = 0;

    for &sep in &separators {
        let count = first_line.matches(sep as char).count();
        if count > best_count {
            best_count = count;
            best_sep = sep;
        }
    }

    best_sep
}

// =============================================================================
// Row predicates
// =============================================================================

/// Whether a row is the optional mapping-annotation row.
///
/// The heuristic: the first cell is a `table.column` reference whose table is
/// one of the known prefixes. Everything about annotation detection lives in
/// this one function.
pub fn is_mapping_annotation(cells: &[String], prefixes: &[String]) -> bool {
    let first = match cells.first() {
        Some(c) => c.trim(),
        None => return false,
    };
    if prefixes.is_empty() || first.is_empty() {
        return false;
    }
    let alternatives: Vec<String> = prefixes.iter().map(|p| regex::escape(p)).collect();
    let pattern = format!(r"^(?:{})\.[A-Za-z_][A-Za-z0-9_]*$", alternatives.join("|"));
    match Regex::new(&pattern) {
        Ok(re) => re.is_match(first),
        Err(_) => false,
    }
}

/// Whether every cell is empty after trimming.
pub fn is_blank(cells: &[String]) -> bool {
    cells.iter().all(|c| c.trim().is_empty())
}

// =============================================================================
// Row reader
// =============================================================================

/// A data row as read from the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    /// 1-based line number where the row starts.
    pub line: u64,
    pub cells: Vec<String>,
}

/// Options for opening a CSV source.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Field delimiter; auto-detected when `None`.
    pub delimiter: Option<u8>,
    /// Encoding label; auto-detected when `None`.
    pub encoding: Option<String>,
    /// Table prefixes recognised in a mapping-annotation row.
    pub annotation_prefixes: Vec<String>,
}

/// What was detected when the file was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvInfo {
    pub encoding: String,
    pub delimiter: char,
    pub headers: Vec<String>,
    pub has_annotation_row: bool,
}

/// Reads a CSV source in bounded chunks.
pub struct RowReader<'a> {
    reader: csv::Reader<DecodingReader<Box<dyn Read + Send + 'a>>>,
    info: CsvInfo,
    /// First data row, read while probing for the annotation row.
    pending: Option<RawRow>,
    blank_rows: usize,
}

impl<'a> RowReader<'a> {
    /// Open a source: sniff encoding and delimiter, read the header row and
    /// skip the annotation row if present.
    pub fn open(source: &'a ImportSource, options: &ReadOptions) -> CsvResult<Self> {
        let sample = source.sample(SAMPLE_SIZE)?;
        if sample.iter().all(|b| b.is_ascii_whitespace()) || sample == UTF8_BOM {
            return Err(CsvError::EmptyFile);
        }

        let encoding_label = options
            .encoding
            .clone()
            .unwrap_or_else(|| detect_encoding(&sample));
        let encoding = encoding_for_label(&encoding_label);

        let delimiter = match options.delimiter {
            Some(d) => d,
            None => {
                let (decoded, _, _) = encoding.decode(&sample);
                detect_delimiter(&decoded)
            }
        };

        let stream = DecodingReader::new(source.open()?, encoding);
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(stream);

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        if headers.iter().all(|h| h.is_empty()) {
            return Err(CsvError::NoHeaders);
        }

        let mut this = Self {
            reader,
            info: CsvInfo {
                encoding: encoding.name().to_lowercase(),
                delimiter: delimiter as char,
                headers,
                has_annotation_row: false,
            },
            pending: None,
            blank_rows: 0,
        };

        if let Some(first) = this.read_record()? {
            if is_mapping_annotation(&first.cells, &options.annotation_prefixes) {
                this.info.has_annotation_row = true;
            } else {
                this.pending = Some(first);
            }
        }

        Ok(this)
    }

    pub fn info(&self) -> &CsvInfo {
        &self.info
    }

    pub fn headers(&self) -> &[String] {
        &self.info.headers
    }

    /// Blank rows skipped so far.
    pub fn blank_rows(&self) -> usize {
        self.blank_rows
    }

    fn read_record(&mut self) -> CsvResult<Option<RawRow>> {
        let mut record = csv::StringRecord::new();
        if !self.reader.read_record(&mut record)? {
            return Ok(None);
        }
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        Ok(Some(RawRow {
            line,
            cells: record.iter().map(str::to_string).collect(),
        }))
    }

    /// Next non-blank data row.
    pub fn next_row(&mut self) -> CsvResult<Option<RawRow>> {
        if let Some(row) = self.pending.take() {
            if !is_blank(&row.cells) {
                return Ok(Some(row));
            }
            self.blank_rows += 1;
        }
        while let Some(row) = self.read_record()? {
            if is_blank(&row.cells) {
                self.blank_rows += 1;
                continue;
            }
            return Ok(Some(row));
        }
        Ok(None)
    }

    /// Up to `size` non-blank rows; `None` once the file is exhausted.
    pub fn next_chunk(&mut self, size: usize) -> CsvResult<Option<Vec<RawRow>>> {
        let mut chunk = Vec::with_capacity(size);
        while chunk.len() < size {
            match self.next_row()? {
                Some(row) => chunk.push(row),
                None => break,
            }
        }
        if chunk.is_empty() {
            Ok(None)
        } else {
            Ok(Some(chunk))
        }
    }
}

/// Count non-blank data rows without keeping them.
pub fn count_data_rows(source: &ImportSource, options: &ReadOptions) -> CsvResult<usize> {
    let mut reader = RowReader::open(source, options)?;
    let mut count = 0;
    while reader.next_row()?.is_some() {
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefixes() -> Vec<String> {
        vec!["catalog_items".to_string(), "languages".to_string()]
    }

    fn read_all(csv: &str, options: &ReadOptions) -> (CsvInfo, Vec<RawRow>, usize) {
        let source = ImportSource::bytes("test.csv", csv.as_bytes().to_vec());
        let mut reader = RowReader::open(&source, options).unwrap();
        let mut rows = Vec::new();
        while let Some(chunk) = reader.next_chunk(2).unwrap() {
            assert!(chunk.len() <= 2);
            rows.extend(chunk);
        }
        (reader.info().clone(), rows, reader.blank_rows())
    }

    #[test]
    fn test_simple_csv() {
        let (info, rows, _) = read_all("ID,Title\nA1,My Book\nA2,Other\n", &ReadOptions::default());
        assert_eq!(info.headers, vec!["ID", "Title"]);
        assert_eq!(info.delimiter, ',');
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].cells, vec!["A1", "My Book"]);
        assert_eq!(rows[0].line, 2);
        assert_eq!(rows[1].line, 3);
    }

    #[test]
    fn test_quoted_values_keep_separators() {
        let csv = "ID,Title,Keywords\nA1,\"Water, Sanitation\",\"a|b\"\n";
        let (_, rows, _) = read_all(csv, &ReadOptions::default());
        assert_eq!(rows[0].cells[1], "Water, Sanitation");
        assert_eq!(rows[0].cells[2], "a|b");
    }

    #[test]
    fn test_blank_rows_skipped_and_counted() {
        let csv = "ID,Title\nA1,One\n,\n  ,  \nA2,Two\n";
        let (_, rows, blanks) = read_all(csv, &ReadOptions::default());
        assert_eq!(rows.len(), 2);
        assert_eq!(blanks, 2);
    }

    #[test]
    fn test_annotation_row_skipped() {
        let csv = "ID,Title\ncatalog_items.internal_id,catalog_items.title\nA1,One\n";
        let options = ReadOptions {
            annotation_prefixes: prefixes(),
            ..Default::default()
        };
        let (info, rows, _) = read_all(csv, &options);
        assert!(info.has_annotation_row);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].cells[0], "A1");
    }

    #[test]
    fn test_annotation_predicate() {
        let p = prefixes();
        assert!(is_mapping_annotation(&["catalog_items.title".to_string()], &p));
        assert!(is_mapping_annotation(&[" languages.name ".to_string()], &p));
        assert!(!is_mapping_annotation(&["A1".to_string()], &p));
        assert!(!is_mapping_annotation(&["publishers.name".to_string()], &p));
        assert!(!is_mapping_annotation(&["catalog_items.title extra".to_string()], &p));
        assert!(!is_mapping_annotation(&[], &p));
    }

    #[test]
    fn test_bom_stripped_from_header() {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice(b"ID,Title\nA1,One\n");
        let source = ImportSource::bytes("bom.csv", bytes);
        let reader = RowReader::open(&source, &ReadOptions::default()).unwrap();
        assert_eq!(reader.headers()[0], "ID");
    }

    #[test]
    fn test_latin1_transcoded() {
        // "Société" in ISO-8859-1
        let mut bytes = b"ID,Title\nA1,Soci".to_vec();
        bytes.extend_from_slice(&[0xE9, 0x74, 0xE9]);
        bytes.push(b'\n');
        let source = ImportSource::bytes("latin.csv", bytes);
        let options = ReadOptions {
            encoding: Some("iso-8859-1".into()),
            ..Default::default()
        };
        let mut reader = RowReader::open(&source, &options).unwrap();
        let row = reader.next_row().unwrap().unwrap();
        assert_eq!(row.cells[1], "Société");
    }

    #[test]
    fn test_empty_file_error() {
        let source = ImportSource::bytes("empty.csv", Vec::new());
        let result = RowReader::open(&source, &ReadOptions::default());
        assert!(matches!(result, Err(CsvError::EmptyFile)));
    }

    #[test]
    fn test_count_data_rows() {
        let source = ImportSource::bytes("c.csv", b"ID,Title\nA1,x\n,\nA2,y\n".to_vec());
        assert_eq!(count_data_rows(&source, &ReadOptions::default()).unwrap(), 2);
    }

    #[test]
    fn test_detect_delimiter() {
        assert_eq!(detect_delimiter("a;b;c\n1;2;3"), b';');
        assert_eq!(detect_delimiter("a,b,c\n1,2,3"), b',');
        assert_eq!(detect_delimiter("a\tb\tc"), b'\t');
        assert_eq!(detect_delimiter("Title|Keywords"), b',');
    }

    #[test]
    fn test_detect_encoding_prefers_utf8() {
        assert_eq!(detect_encoding("Société".as_bytes()), "utf-8");
        assert_eq!(detect_encoding(b"plain ascii"), "utf-8");
    }

    #[test]
    fn test_decoding_reader_small_buffers() {
        let data = "é;".repeat(10_000);
        let mut reader = DecodingReader::new(Cursor::new(data.as_bytes().to_vec()), UTF_8);
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data.as_bytes());
    }
}
