mod json;
mod table;
mod yaml;

pub use json::JsonFormatter;
pub use table::TableFormatter;
pub use yaml::YamlFormatter;

use crate::cli::OutputFormat;
use crate::command::Command;
use crate::resolver::CommandTargets;
use crate::watcher::ImageIndex;

/// Rows ready for rendering
#[derive(Debug, Clone)]
pub struct Report {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Report {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn format(&self, format: &OutputFormat, no_headers: bool) -> String {
        match format {
            OutputFormat::Table => TableFormatter::format(self, no_headers),
            OutputFormat::Json => JsonFormatter::format(self),
            OutputFormat::Yaml => YamlFormatter::format(self),
        }
    }

    pub fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    /// Append another report's rows; columns must match
    pub fn extend(&mut self, other: Report) {
        self.rows.extend(other.rows);
    }

    /// One object per row keyed by column name
    pub fn to_json_rows(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(col, val)| (col.clone(), serde_json::Value::String(val.clone())))
                    .collect()
            })
            .collect()
    }

    /// Targets, exclusions and failures of one resolved command
    pub fn from_targets(command: &Command, targets: &CommandTargets) -> Self {
        let mut report = Report::new(&["command", "target", "status", "images", "detail"]);
        let name = command.command_name.to_string();

        for id in &targets.identifiers {
            let images = targets
                .images
                .get(id)
                .map(|containers| {
                    let mut pairs: Vec<String> = containers
                        .iter()
                        .map(|(container, image)| format!("{}={}", container, image))
                        .collect();
                    pairs.sort();
                    pairs.join(",")
                })
                .unwrap_or_default();
            let instances = targets
                .instance_ids
                .get(id)
                .map(|ids| ids.join(","))
                .unwrap_or_default();
            report.push(vec![name.clone(), id.clone(), "target".into(), images, instances]);
        }

        for id in &targets.excluded {
            report.push(vec![
                name.clone(),
                id.clone(),
                "excluded".into(),
                String::new(),
                "namespace excluded for command".into(),
            ]);
        }

        for err in &targets.errors {
            report.push(vec![
                name.clone(),
                format!("{}/{}", err.namespace, err.name),
                "error".into(),
                String::new(),
                err.to_string(),
            ]);
        }

        report
    }

    /// Image index, sorted by image
    pub fn from_image_index(index: &ImageIndex) -> Self {
        let mut report = Report::new(&["image", "wlids"]);
        let mut images: Vec<_> = index.iter().collect();
        images.sort_by(|a, b| a.0.cmp(b.0));
        for (image, wlids) in images {
            report.push(vec![image.clone(), wlids.join(",")]);
        }
        report
    }
}
