use textplots::{Chart, Plot, Shape};

use crate::record::ScanRecord;

/// Engineering exponent (multiple of 3) that brings `max_abs` into [1, 1000)
fn determine_exponent(max_abs: f64) -> i32 {
    if !(max_abs.is_finite() && max_abs > 0.0) {
        return 0;
    }
    let e = max_abs.log10().floor() as i32;
    e - e.rem_euclid(3)
}

/// Make a sequence of angles continuous across the 0/360 wrap
fn unwrap_angles(angles: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(angles.len());
    let mut offset = 0.0;
    for (i, &a) in angles.iter().enumerate() {
        if i > 0 {
            let diff = a - angles[i - 1];
            if diff < -180.0 {
                offset += 360.0;
            } else if diff > 180.0 {
                offset -= 360.0;
            }
        }
        out.push(a + offset);
    }
    out
}

/// Plot (angle, value) pairs as a line chart on the terminal
///
/// # Arguments
/// * `points` - (angle in degrees, value) in scan order
/// * `title` - Optional title for the plot
/// * `width` - Optional plot width (default: 120)
/// * `height` - Optional plot height (default: 40)
pub fn plot_profile(
    points: &[(f64, f64)],
    title: Option<&str>,
    width: Option<usize>,
    height: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    if points.is_empty() {
        return Err("Cannot plot empty data".into());
    }

    let width = width.unwrap_or(120);
    let height = height.unwrap_or(40);

    let angles: Vec<f64> = points.iter().map(|p| p.0).collect();
    let angles = unwrap_angles(&angles);

    let min_value = points.iter().fold(f64::INFINITY, |a, p| a.min(p.1));
    let max_value = points.iter().fold(f64::NEG_INFINITY, |a, p| a.max(p.1));
    let exponent = determine_exponent(max_value.abs().max(min_value.abs()));
    let scale = 10f64.powi(-exponent);

    let frame: Vec<(f32, f32)> = angles
        .iter()
        .zip(points)
        .map(|(&angle, &(_, value))| (angle as f32, (value * scale) as f32))
        .collect();

    let (x_min, x_max) = angles
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &a| {
            (lo.min(a), hi.max(a))
        });
    // textplots needs a non-empty x range
    let x_max = if x_max > x_min { x_max } else { x_min + 1.0 };

    println!("{}", title.unwrap_or("Column density"));
    println!("X-axis: Scan angle (deg) | Y-axis: x1e{}", exponent);
    println!(
        "{} points | {:.1} to {:.1} deg | values {:.3} to {:.3} x1e{}",
        points.len(),
        x_min,
        x_max,
        min_value * scale,
        max_value * scale,
        exponent
    );
    println!("{}", "─".repeat(width));

    Chart::new(width as u32, height as u32, x_min as f32, x_max as f32)
        .lineplot(&Shape::Lines(&frame))
        .nice();

    println!("Scan angle →");

    Ok(())
}

/// Plot the converged column densities of `species` across one scan
pub fn plot_record(
    record: &ScanRecord,
    species: &str,
    width: Option<usize>,
    height: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let profile = record.column_profile(species);
    if profile.is_empty() {
        return Err(format!(
            "scan {} has no converged fits for {}",
            record.scan_number(),
            species
        )
        .into());
    }

    let title = match record.peak_angle(species) {
        Some((angle, value)) => format!(
            "{} scan {}: {} (peak {:.3e} at {:.1} deg)",
            record.station_name(),
            record.scan_number(),
            species,
            value,
            angle
        ),
        None => format!(
            "{} scan {}: {}",
            record.station_name(),
            record.scan_number(),
            species
        ),
    };
    plot_profile(&profile, Some(&title), width, height)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_determine_exponent() {
        assert_eq!(determine_exponent(5.0), 0);
        assert_eq!(determine_exponent(4.2e17), 15);
        assert_eq!(determine_exponent(2.5e18), 18);
        assert_eq!(determine_exponent(0.005), -3);
        assert_eq!(determine_exponent(0.0), 0);
    }

    #[test]
    fn test_unwrap_angles_across_zero() {
        let unwrapped = unwrap_angles(&[358.0, 359.0, 0.0, 1.0]);
        assert_eq!(unwrapped, vec![358.0, 359.0, 360.0, 361.0]);
        let unwrapped = unwrap_angles(&[1.0, 0.0, 359.0]);
        assert_eq!(unwrapped, vec![1.0, 0.0, -1.0]);
    }

    #[test]
    fn test_plot_profile_basic() {
        let points = vec![(170.0, 1e16), (180.0, 4e17), (190.0, 2e16)];
        assert!(plot_profile(&points, Some("SO2"), Some(60), Some(20)).is_ok());
    }

    #[test]
    fn test_plot_empty_data() {
        assert!(plot_profile(&[], None, None, None).is_err());
    }
}
