//! Three-section licence extract files.
//!
//! An extract holds a summary, a token-usage table and the detail rows as
//! separate CSV documents, each starting at a known header word and ending
//! at a NUL byte.

use chrono::NaiveDate;

use crate::summary::{parse_summary, LicenceSummary};
use crate::ExtractError;

pub const SECTION_MARKERS: [&str; 3] = ["samplingStatus", "Group", "Req Number"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractSections<'a> {
    pub summary: &'a [u8],
    pub tokens: &'a [u8],
    pub details: &'a [u8],
}

/// Locate the sections in order; each search starts where the previous
/// section ended.
pub fn split_sections(bytes: &[u8]) -> Result<ExtractSections<'_>, ExtractError> {
    let mut rest = bytes;
    let mut found: Vec<&[u8]> = Vec::with_capacity(SECTION_MARKERS.len());
    for marker in SECTION_MARKERS {
        let start = find(rest, marker.as_bytes())
            .ok_or(ExtractError::MissingSection(marker))?;
        rest = &rest[start..];
        let end = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(ExtractError::UnterminatedSection(marker))?;
        found.push(&rest[..end]);
        rest = &rest[end..];
    }
    Ok(ExtractSections {
        summary: found[0],
        tokens: found[1],
        details: found[2],
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

impl ExtractSections<'_> {
    /// The summary pairs followed by the token table, in the layout of a
    /// standalone licence summary.
    pub fn summary_document(&self) -> Vec<u8> {
        let mut doc = Vec::with_capacity(self.summary.len() + self.tokens.len() + 1);
        doc.extend_from_slice(self.summary);
        if !doc.ends_with(b"\n") {
            doc.push(b'\n');
        }
        doc.extend_from_slice(self.tokens);
        doc
    }

    pub fn licence(&self) -> Result<LicenceSummary, ExtractError> {
        parse_summary(&self.summary_document())
    }
}

/// `extract:<licence name>_<expiry date>`, stable across re-issues of the
/// same licence.
pub fn extract_label(licence: &LicenceSummary) -> Option<String> {
    let expiry: NaiveDate = licence.expiry?;
    if licence.name.is_empty() {
        return None;
    }
    Some(format!(
        "extract:{}_{}",
        licence.name,
        expiry.format("%Y-%m-%d")
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_extract() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"\xef\xbb\xbfheader noise\n");
        bytes.extend_from_slice(
            b"samplingStatus,OK\nlicenceName,ACME Prod\nexpiry,31 December 2026\nmode,Normal\nhostname,licd1\nhostid,abc123\n",
        );
        bytes.push(0);
        bytes.extend_from_slice(
            b"Group,Token,Total,Used,Free\nOverall,server,100,42,58\nOverall,cpu,Unlimited,7,Unlimited\nGW1,server,100,3,97\n",
        );
        bytes.push(0);
        bytes.extend_from_slice(
            b"Req Number,ParentRequestingComponent,RequestingComponent,Component,Item,Description,Number\n\
1,gateway:GW1,gateway:GW1,gateway_component,gateway,,1\n\
2,gateway:GW1,gateway:GW1,binary,netprobe,itrsrh1:7036 [abcd],1\n\
3,gateway:GW1,gateway:GW1,plugin,cpu,itrsrh1:7036 [abcd],2\n\
4,gateway:GW1,gateway:GW1,ca_plugin,prometheus-plugin,entity-one,1\n\
5,EQ,gateway:GW1,gateway-plugin,gateway-breachpredictor,,1\n\
6,gateway:GW1,gateway:GW1,mystery,thing,,1\n",
        );
        bytes.push(0);
        bytes
    }

    #[test]
    fn sections_split_in_marker_order() {
        let bytes = sample_extract();
        let sections = split_sections(&bytes).expect("split");
        assert!(sections.summary.starts_with(b"samplingStatus"));
        assert!(sections.tokens.starts_with(b"Group,Token"));
        assert!(sections.details.starts_with(b"Req Number"));
        assert!(!sections.details.contains(&0));
    }

    #[test]
    fn fewer_than_three_sections_is_an_error() {
        let mut bytes = b"samplingStatus,OK\n".to_vec();
        bytes.push(0);
        bytes.extend_from_slice(b"Group,Token\n");
        bytes.push(0);
        assert!(matches!(
            split_sections(&bytes),
            Err(ExtractError::MissingSection("Req Number"))
        ));

        let unterminated = b"samplingStatus,OK\n".to_vec();
        assert!(matches!(
            split_sections(&unterminated),
            Err(ExtractError::UnterminatedSection("samplingStatus"))
        ));
    }

    #[test]
    fn label_uses_licence_name_and_expiry() {
        let bytes = sample_extract();
        let sections = split_sections(&bytes).expect("split");
        let licence = sections.licence().expect("licence");
        assert_eq!(
            extract_label(&licence).as_deref(),
            Some("extract:ACME Prod_2026-12-31")
        );
        assert_eq!(licence.tokens.len(), 2);

        let unnamed = LicenceSummary {
            name: String::new(),
            ..licence
        };
        assert!(extract_label(&unnamed).is_none());
    }
}
