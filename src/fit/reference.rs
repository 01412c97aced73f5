use ndarray::Array1;
use std::fs;
use std::path::Path;

/// Absorption cross-section sampled on an ascending wavelength grid.
///
/// Reference files are plain text with two whitespace or comma separated
/// columns, wavelength in nm and cross-section in cm²/molecule. Blank lines
/// and lines starting with `#` are ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossSection {
    wavelengths: Vec<f64>,
    values: Vec<f64>,
}

impl CrossSection {
    pub fn from_points(wavelengths: Vec<f64>, values: Vec<f64>) -> Result<Self, String> {
        if wavelengths.len() != values.len() {
            return Err(format!(
                "{} wavelengths but {} values",
                wavelengths.len(),
                values.len()
            ));
        }
        if wavelengths.len() < 2 {
            return Err("at least two points are required".to_string());
        }
        if wavelengths.iter().chain(&values).any(|v| !v.is_finite()) {
            return Err("non-finite value".to_string());
        }

        let mut points: Vec<(f64, f64)> = wavelengths.into_iter().zip(values).collect();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        if points.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err("duplicate wavelength".to_string());
        }

        let (wavelengths, values) = points.into_iter().unzip();
        Ok(Self {
            wavelengths,
            values,
        })
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let mut wavelengths = Vec::new();
        let mut values = Vec::new();

        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line
                .split(|c: char| c.is_whitespace() || c == ',')
                .filter(|f| !f.is_empty());
            let (Some(wl), Some(xs)) = (fields.next(), fields.next()) else {
                return Err(format!("line {}: expected two columns", line_no + 1));
            };
            let parse = |field: &str| {
                field
                    .parse::<f64>()
                    .map_err(|e| format!("line {}: '{}' ({})", line_no + 1, field, e))
            };
            wavelengths.push(parse(wl)?);
            values.push(parse(xs)?);
        }

        Self::from_points(wavelengths, values)
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let text = fs::read_to_string(path).map_err(|e| e.to_string())?;
        Self::parse(&text)
    }

    pub fn len(&self) -> usize {
        self.wavelengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelengths.is_empty()
    }

    pub fn range(&self) -> (f64, f64) {
        (self.wavelengths[0], self.wavelengths[self.len() - 1])
    }

    /// Index of the segment `[i, i+1]` holding `wl`, `None` outside the grid
    fn segment(&self, wl: f64) -> Option<usize> {
        let (lo, hi) = self.range();
        if !(lo..=hi).contains(&wl) {
            return None;
        }
        let upper = self.wavelengths.partition_point(|&w| w <= wl);
        Some(upper.saturating_sub(1).min(self.len() - 2))
    }

    /// Linear interpolation, held flat beyond the ends of the grid
    pub fn value_at(&self, wl: f64) -> f64 {
        match self.segment(wl) {
            Some(i) => {
                let (w0, w1) = (self.wavelengths[i], self.wavelengths[i + 1]);
                let t = (wl - w0) / (w1 - w0);
                self.values[i] + t * (self.values[i + 1] - self.values[i])
            }
            None if wl < self.wavelengths[0] => self.values[0],
            None => self.values[self.len() - 1],
        }
    }

    /// Derivative of [`value_at`](Self::value_at) with respect to wavelength
    pub fn slope_at(&self, wl: f64) -> f64 {
        match self.segment(wl) {
            Some(i) => {
                (self.values[i + 1] - self.values[i])
                    / (self.wavelengths[i + 1] - self.wavelengths[i])
            }
            None => 0.0,
        }
    }

    pub fn resample(&self, grid: &Array1<f64>) -> Array1<f64> {
        grid.mapv(|wl| self.value_at(wl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    #[test]
    fn test_parse_skips_comments_and_sorts() {
        let xs = CrossSection::parse(
            "# SO2 at 298 K\n\n312.0  3.0e-19\n310.0, 1.0e-19\n311.0\t2.0e-19\n",
        )
        .unwrap();
        assert_eq!(xs.len(), 3);
        assert_eq!(xs.range(), (310.0, 312.0));
        assert_relative_eq!(xs.value_at(310.5), 1.5e-19, max_relative = 1e-12);
    }

    #[test]
    fn test_parse_rejects_bad_rows() {
        assert!(CrossSection::parse("310.0\n").is_err());
        assert!(CrossSection::parse("310.0 abc\n311.0 1.0\n").is_err());
        assert!(CrossSection::parse("310.0 1.0\n").is_err());
        assert!(CrossSection::parse("310.0 1.0\n310.0 2.0\n").is_err());
    }

    #[test]
    fn test_flat_extension_and_slope() {
        let xs = CrossSection::from_points(vec![1.0, 2.0, 4.0], vec![10.0, 20.0, 0.0]).unwrap();
        assert_eq!(xs.value_at(0.0), 10.0);
        assert_eq!(xs.value_at(5.0), 0.0);
        assert_eq!(xs.value_at(4.0), 0.0);
        assert_relative_eq!(xs.value_at(3.0), 10.0);
        assert_relative_eq!(xs.slope_at(1.5), 10.0);
        assert_relative_eq!(xs.slope_at(3.0), -10.0);
        assert_eq!(xs.slope_at(4.5), 0.0);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# wl xs").unwrap();
        writeln!(file, "300.0 1e-20").unwrap();
        writeln!(file, "301.0 3e-20").unwrap();
        let xs = CrossSection::load(file.path()).unwrap();
        let grid = Array1::from(vec![299.0, 300.5, 302.0]);
        let resampled = xs.resample(&grid);
        assert_relative_eq!(resampled[1], 2e-20, max_relative = 1e-12);
        assert_eq!(resampled[0], 1e-20);

        assert!(CrossSection::load(Path::new("/nonexistent/ref.txt")).is_err());
    }
}
