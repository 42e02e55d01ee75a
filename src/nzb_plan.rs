//! `NzbPlanBuilder`: turns a parsed NZB document into one `FetchPlan` per
//! file entry (SPEC_FULL.md §3 ambient addition), generalizing the
//! teacher's `download::nzb::Nzb` wrapper around `nzb_rs`.

use std::path::Path;

use crate::error::{NzbError, StreamError};
use crate::plan::{FetchPlan, SegmentId};

/// One file entry from an NZB document, reduced to what streaming needs:
/// an ordered segment list and a group to fetch them from.
#[derive(Debug, Clone)]
pub struct NzbFileEntry {
    pub subject: String,
    pub filename: Option<String>,
    pub plan: FetchPlan,
}

pub struct NzbPlanBuilder;

impl NzbPlanBuilder {
    pub fn from_str(content: &str) -> Result<Vec<NzbFileEntry>, StreamError> {
        let parsed = nzb_rs::Nzb::parse(content)
            .map_err(|e| NzbError::ParseError(e.to_string()))?;

        if parsed.files.is_empty() {
            return Err(NzbError::EmptyNzb.into());
        }

        parsed
            .files
            .iter()
            .map(|file| {
                if file.segments.is_empty() {
                    return Err(NzbError::EmptyFile.into());
                }

                // Segments in an NZB are declared in transfer order, not
                // necessarily sorted by `number`; the plan's order is what
                // drives byte-offset math so it must be numeric order.
                let mut ordered: Vec<&nzb_rs::Segment> = file.segments.iter().collect();
                ordered.sort_by_key(|s| s.number);

                let mut ids = Vec::with_capacity(ordered.len());
                let mut sizes = Vec::with_capacity(ordered.len());
                for segment in &ordered {
                    if segment.size == 0 {
                        return Err(NzbError::InvalidSegment(format!(
                            "segment {} declares zero size",
                            segment.number
                        ))
                        .into());
                    }
                    ids.push(SegmentId::new(segment.message_id.clone()));
                    sizes.push(segment.size as u64);
                }

                let group = file.groups.first().cloned();
                let plan = FetchPlan::new(ids, sizes, group);

                Ok(NzbFileEntry {
                    subject: file.subject.clone(),
                    filename: filename_from_subject(&file.subject),
                    plan,
                })
            })
            .collect()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Vec<NzbFileEntry>, StreamError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|_| NzbError::NotFound(path.to_path_buf()))?;
        Self::from_str(&content)
    }
}

/// Pulls a quoted filename out of a subject line like
/// `[1/9] - "archive.part01.rar" yEnc (1/5202)`. Best-effort: returns
/// `None` rather than erroring when a subject has no quoted segment.
fn filename_from_subject(subject: &str) -> Option<String> {
    let rest = subject.split_once('"')?.1;
    let (name, _) = rest.split_once('"')?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}
