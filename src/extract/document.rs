// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Extractors for plain text, office documents and spreadsheets

use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::{Cursor, Read};

use super::{extension_of, FormatExtractor};
use crate::{ArchivistError, Result};

/// Rows read from the first sheet of a workbook
const SPREADSHEET_ROWS: usize = 200;

/// Text-family files decoded as UTF-8 (lossy)
pub struct PlainTextExtractor;

impl FormatExtractor for PlainTextExtractor {
    fn name(&self) -> &'static str {
        "text"
    }

    fn supported_extensions(&self) -> &[&str] {
        &[
            "txt", "md", "markdown", "rst", "adoc", "asciidoc", "rtf", "csv", "tsv", "log",
            "json", "yaml", "yml", "toml", "xml", "html", "htm",
        ]
    }

    fn extract(&self, _filename: &str, bytes: &[u8]) -> Result<String> {
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// DOCX and PPTX via their zipped XML parts
pub struct OfficeExtractor;

impl OfficeExtractor {
    fn open(bytes: &[u8]) -> Result<zip::ZipArchive<Cursor<&[u8]>>> {
        zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| ArchivistError::Extraction(format!("Failed to open office file: {}", e)))
    }

    fn read_part(archive: &mut zip::ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<String> {
        let mut part = archive
            .by_name(name)
            .map_err(|_| ArchivistError::Extraction(format!("No {} found", name)))?;
        let mut xml = String::new();
        part.read_to_string(&mut xml)?;
        Ok(xml)
    }

    fn extract_docx(bytes: &[u8]) -> Result<String> {
        let mut archive = Self::open(bytes)?;
        let xml = Self::read_part(&mut archive, "word/document.xml")?;
        xml_text(&xml, b"w:t", b"w:p")
    }

    fn extract_pptx(bytes: &[u8]) -> Result<String> {
        let mut archive = Self::open(bytes)?;

        let mut slides: Vec<(u32, String)> = archive
            .file_names()
            .filter_map(|name| {
                let number = name
                    .strip_prefix("ppt/slides/slide")?
                    .strip_suffix(".xml")?
                    .parse()
                    .ok()?;
                Some((number, name.to_string()))
            })
            .collect();
        slides.sort();

        let mut text = String::new();
        for (_, name) in slides {
            let xml = Self::read_part(&mut archive, &name)?;
            text.push_str(&xml_text(&xml, b"a:t", b"a:p")?);
            text.push('\n');
        }
        Ok(text)
    }
}

impl FormatExtractor for OfficeExtractor {
    fn name(&self) -> &'static str {
        "office"
    }

    fn supported_extensions(&self) -> &[&str] {
        &["docx", "pptx"]
    }

    fn extract(&self, filename: &str, bytes: &[u8]) -> Result<String> {
        match extension_of(filename).as_str() {
            "docx" => Self::extract_docx(bytes),
            "pptx" => Self::extract_pptx(bytes),
            other => Err(ArchivistError::UnsupportedFileType(other.to_string())),
        }
    }
}

/// Collect the text of every `text_tag` element, one line per `block_tag`
fn xml_text(xml: &str, text_tag: &[u8], block_tag: &[u8]) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut out = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == text_tag => in_text = true,
            Ok(Event::End(e)) if e.name().as_ref() == text_tag => in_text = false,
            Ok(Event::End(e)) if e.name().as_ref() == block_tag => out.push('\n'),
            Ok(Event::Text(t)) if in_text => {
                let text = t
                    .unescape()
                    .map_err(|e| ArchivistError::Extraction(format!("Bad XML text: {}", e)))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(ArchivistError::Extraction(format!(
                    "XML parse error at {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
    }

    Ok(out)
}

/// XLSX/XLS/ODS via calamine
pub struct SpreadsheetExtractor;

impl FormatExtractor for SpreadsheetExtractor {
    fn name(&self) -> &'static str {
        "spreadsheet"
    }

    fn supported_extensions(&self) -> &[&str] {
        &["xlsx", "xls", "xlsm", "ods"]
    }

    fn extract(&self, _filename: &str, bytes: &[u8]) -> Result<String> {
        use calamine::{open_workbook_auto_from_rs, Reader as _};

        let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
            .map_err(|e| ArchivistError::Extraction(format!("Failed to open spreadsheet: {}", e)))?;

        let sheet_names: Vec<String> = workbook.sheet_names().to_vec();
        let mut text = format!("Sheets: {}\n", sheet_names.join(", "));

        if let Some(sheet_name) = sheet_names.first() {
            if let Ok(range) = workbook.worksheet_range(sheet_name) {
                for row in range.rows().take(SPREADSHEET_ROWS) {
                    let cells: Vec<String> = row.iter().map(|c| c.to_string()).collect();
                    text.push_str(&cells.join("\t"));
                    text.push('\n');
                }
            }
        }

        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn zipped(parts: &[(&str, &str)]) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            for (name, body) in parts {
                writer.start_file(*name, SimpleFileOptions::default()).unwrap();
                writer.write_all(body.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buffer.into_inner()
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let bytes = zipped(&[(
            "word/document.xml",
            r#"<w:document><w:body><w:p><w:r><w:t>Invoice</w:t></w:r><w:r><w:t xml:space="preserve"> Acme &amp; Co</w:t></w:r></w:p><w:p><w:r><w:t>Total</w:t></w:r></w:p></w:body></w:document>"#,
        )]);
        let text = OfficeExtractor.extract("march.docx", &bytes).unwrap();
        assert_eq!(text, "Invoice Acme & Co\nTotal\n");
    }

    #[test]
    fn pptx_slides_read_in_numeric_order() {
        let bytes = zipped(&[
            ("ppt/slides/slide10.xml", "<p:sld><a:p><a:t>Ten</a:t></a:p></p:sld>"),
            ("ppt/slides/slide2.xml", "<p:sld><a:p><a:t>Two</a:t></a:p></p:sld>"),
        ]);
        let text = OfficeExtractor.extract("deck.pptx", &bytes).unwrap();
        let two = text.find("Two").unwrap();
        let ten = text.find("Ten").unwrap();
        assert!(two < ten);
    }

    #[test]
    fn docx_without_body_fails() {
        let bytes = zipped(&[("other.xml", "<x/>")]);
        assert!(OfficeExtractor.extract("empty.docx", &bytes).is_err());
    }
}
