use super::Report;

pub struct JsonFormatter;

impl JsonFormatter {
    pub fn format(report: &Report) -> String {
        let rows = report.to_json_rows();
        serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string())
    }
}
