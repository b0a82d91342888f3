use chrono::{DateTime, Utc};
use serde::Serialize;
use std::str::FromStr;

use super::{MatchResult, SearchResponse};
use crate::error::{FaceError, Result};
use crate::media::MediaStorage;

const REPORTS_DIR: &str = "reports";

/// Report format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Csv,
    Json,
}

impl ReportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Csv => "csv",
            ReportFormat::Json => "json",
        }
    }
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ReportFormat::Csv),
            "json" => Ok(ReportFormat::Json),
            other => Err(format!("unknown report format: {other}")),
        }
    }
}

#[derive(Serialize)]
struct Report<'a> {
    generated_at: DateTime<Utc>,
    query: Option<&'a str>,
    query_face_count: usize,
    matches: &'a [MatchResult],
}

/// Render a search response under `<media root>/reports/` and return the
/// path relative to the media root.
pub fn write_report(
    media: &MediaStorage,
    query_name: Option<&str>,
    response: &SearchResponse,
    format: ReportFormat,
) -> Result<String> {
    let generated_at = Utc::now();
    let relative = format!(
        "{REPORTS_DIR}/search_{}.{}",
        generated_at.format("%Y%m%d_%H%M%S_%6f"),
        format.extension()
    );

    let bytes = match format {
        ReportFormat::Json => render_json(&Report {
            generated_at,
            query: query_name,
            query_face_count: response.query_face_count,
            matches: &response.matches,
        })?,
        ReportFormat::Csv => render_csv(&response.matches)?,
    };

    media.write_file(&relative, &bytes)?;
    tracing::info!(path = %relative, matches = response.matches.len(), "Search report written");
    Ok(relative)
}

fn render_json(report: &Report<'_>) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(report).map_err(|e| FaceError::Report(e.to_string()))
}

fn render_csv(matches: &[MatchResult]) -> Result<Vec<u8>> {
    let report_err = |e: csv::Error| FaceError::Report(e.to_string());
    let mut wtr = csv::Writer::from_writer(Vec::new());

    wtr.write_record([
        "rank",
        "photo_id",
        "distance",
        "person_id",
        "media_reference",
        "media_url",
        "labels",
        "face_top",
        "face_right",
        "face_bottom",
        "face_left",
    ])
    .map_err(report_err)?;

    for (rank, m) in matches.iter().enumerate() {
        let labels: Vec<&str> = m.labels.iter().map(String::as_str).collect();
        let bbox = &m.matched_face.bounding_box;
        wtr.write_record([
            &(rank + 1).to_string(),
            &m.photo_id.to_string(),
            &format!("{:.4}", m.distance),
            &m.person_id.map(|p| p.to_string()).unwrap_or_default(),
            &m.media_reference,
            &m.media_url,
            &labels.join(";"),
            &bbox.top.to_string(),
            &bbox.right.to_string(),
            &bbox.bottom.to_string(),
            &bbox.left.to_string(),
        ])
        .map_err(report_err)?;
    }

    wtr.into_inner()
        .map_err(|e| FaceError::Report(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConfig;
    use crate::db::{BoundingBox, PersonId, PhotoId};
    use crate::search::FaceSnapshot;
    use tempfile::tempdir;

    fn response() -> SearchResponse {
        let bounding_box = BoundingBox::new(10, 60, 70, 20).unwrap();
        SearchResponse {
            query_face_count: 1,
            matches: vec![
                MatchResult {
                    photo_id: PhotoId(3),
                    media_reference: "uploads/aaa.jpg".to_string(),
                    media_url: "/media/uploads/aaa.jpg".to_string(),
                    distance: 0.0,
                    labels: ["family".to_string(), "beach".to_string()].into(),
                    person_id: Some(PersonId(1)),
                    matched_face: FaceSnapshot {
                        bounding_box,
                        distance: 0.0,
                    },
                },
                MatchResult {
                    photo_id: PhotoId(7),
                    media_reference: "uploads/bbb.png".to_string(),
                    media_url: "/media/uploads/bbb.png".to_string(),
                    distance: 0.25,
                    labels: Default::default(),
                    person_id: Some(PersonId(1)),
                    matched_face: FaceSnapshot {
                        bounding_box,
                        distance: 0.25,
                    },
                },
            ],
        }
    }

    fn media(root: &std::path::Path) -> MediaStorage {
        MediaStorage::new(&MediaConfig {
            root: root.to_path_buf(),
            url_prefix: "/media".to_string(),
        })
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("CSV".parse::<ReportFormat>().unwrap(), ReportFormat::Csv);
        assert_eq!("json".parse::<ReportFormat>().unwrap(), ReportFormat::Json);
        assert!("pdf".parse::<ReportFormat>().is_err());
    }

    #[test]
    fn test_csv_report() {
        let dir = tempdir().unwrap();
        let media = media(dir.path());

        let relative = write_report(&media, Some("query.jpg"), &response(), ReportFormat::Csv).unwrap();
        assert!(relative.starts_with("reports/search_"));
        assert!(relative.ends_with(".csv"));

        let content = String::from_utf8(media.read_bytes(&relative).unwrap()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("rank,photo_id,distance"));
        assert!(lines[1].starts_with("1,3,0.0000,1,uploads/aaa.jpg"));
        assert!(lines[1].contains("beach;family"));
        assert!(lines[2].starts_with("2,7,0.2500"));
    }

    #[test]
    fn test_json_report() {
        let dir = tempdir().unwrap();
        let media = media(dir.path());

        let relative = write_report(&media, Some("query.jpg"), &response(), ReportFormat::Json).unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(&media.read_bytes(&relative).unwrap()).unwrap();

        assert_eq!(value["query"], "query.jpg");
        assert_eq!(value["query_face_count"], 1);
        assert_eq!(value["matches"][0]["photo_id"], 3);
        assert_eq!(value["matches"][1]["media_url"], "/media/uploads/bbb.png");
    }
}
