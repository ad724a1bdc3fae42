//! Column-aligned text tables for peer listings.
//!
//! Columns are sized to their widest cell and separated by two spaces.
//! Header cells are bold when rendered for a terminal.

use colored::Colorize;

pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Add a row. Missing cells are left blank, extra cells dropped.
    pub fn add_row<S: AsRef<str>>(&mut self, cells: &[S]) {
        let row = (0..self.headers.len())
            .map(|i| cells.get(i).map_or("", |c| c.as_ref()).to_string())
            .collect();
        self.rows.push(row);
    }

    fn widths(&self) -> Vec<usize> {
        self.headers
            .iter()
            .enumerate()
            .map(|(i, h)| {
                self.rows
                    .iter()
                    .map(|r| r[i].chars().count())
                    .fold(h.chars().count(), usize::max)
            })
            .collect()
    }

    fn line(cells: &[String], widths: &[usize]) -> String {
        let padded: Vec<String> = cells
            .iter()
            .zip(widths)
            .map(|(cell, &w)| format!("{cell:<w$}"))
            .collect();
        padded.join("  ").trim_end().to_string()
    }

    /// Render without styling.
    #[cfg(test)]
    fn render_plain(&self) -> String {
        let widths = self.widths();
        let mut lines = vec![Self::line(&self.headers, &widths)];
        lines.extend(self.rows.iter().map(|r| Self::line(r, &widths)));
        lines.join("\n")
    }

    pub fn print(&self) {
        let widths = self.widths();
        println!("  {}", Self::line(&self.headers, &widths).as_str().bold());
        for row in &self.rows {
            println!("  {}", Self::line(row, &widths));
        }
    }
}
