//! Plain-text column alignment for the `status` table.

/// Render rows (the first row is the header) with each column padded to
/// its widest cell, two spaces between columns.
pub fn render(rows: &[Vec<String>]) -> String {
    let Some(first) = rows.first() else {
        return String::new();
    };
    let mut widths = vec![0usize; first.len()];
    for row in rows {
        for (index, cell) in row.iter().enumerate() {
            if index < widths.len() {
                widths[index] = widths[index].max(cell.len());
            }
        }
    }

    let mut out = String::new();
    for row in rows {
        let mut line = String::new();
        for (index, cell) in row.iter().enumerate() {
            if index > 0 {
                line.push_str("  ");
            }
            line.push_str(cell);
            let width = widths.get(index).copied().unwrap_or(0);
            if index + 1 < row.len() {
                line.push_str(&" ".repeat(width.saturating_sub(cell.len())));
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|cell| cell.to_string()).collect()
    }

    #[test]
    fn columns_align_to_the_widest_cell() {
        let rendered = render(&[
            row(&["jobid", "status"]),
            row(&["2c0ff5e1", "RUNNING"]),
            row(&["7", "SUCCESS"]),
        ]);
        assert_eq!(rendered, "jobid     status\n2c0ff5e1  RUNNING\n7         SUCCESS\n");
    }

    #[test]
    fn empty_input_renders_nothing() {
        assert_eq!(render(&[]), "");
    }

    #[test]
    fn empty_cells_take_no_trailing_space() {
        let rendered = render(&[row(&["a", "b"]), row(&["wide-cell", ""])]);
        assert_eq!(rendered, "a          b\nwide-cell\n");
    }
}
