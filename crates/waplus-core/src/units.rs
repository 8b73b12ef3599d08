use std::collections::HashMap;

use once_cell::sync::Lazy;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Length,
    Area,
    Volume,
    Flow,
    Temperature,
    Fraction,
}

/// `base = value * scale + offset`, where base is the SI unit of the dimension.
#[derive(Debug, Clone, Copy)]
pub struct UnitDescriptor {
    pub symbol: &'static str,
    pub dimension: Dimension,
    pub scale: f64,
    pub offset: f64,
    pub aliases: &'static [&'static str],
}

const fn linear(
    symbol: &'static str,
    dimension: Dimension,
    scale: f64,
    aliases: &'static [&'static str],
) -> UnitDescriptor {
    UnitDescriptor {
        symbol,
        dimension,
        scale,
        offset: 0.0,
        aliases,
    }
}

static UNIT_TABLE: &[UnitDescriptor] = &[
    linear("mm", Dimension::Length, 0.001, &["millimeter", "millimetre", "millimeters"]),
    linear("cm", Dimension::Length, 0.01, &["centimeter", "centimetre"]),
    linear("m", Dimension::Length, 1.0, &["meter", "metre", "meters"]),
    linear("km", Dimension::Length, 1000.0, &["kilometer", "kilometre"]),
    linear("in", Dimension::Length, 0.0254, &["inch", "inches"]),
    linear("ft", Dimension::Length, 0.3048, &["foot", "feet"]),
    linear("m2", Dimension::Area, 1.0, &["m^2", "sq_m"]),
    linear("ha", Dimension::Area, 1.0e4, &["hectare", "hectares"]),
    linear("km2", Dimension::Area, 1.0e6, &["km^2", "sq_km"]),
    linear("l", Dimension::Volume, 1.0e-3, &["L", "liter", "litre"]),
    linear("m3", Dimension::Volume, 1.0, &["m^3", "cubic_meter"]),
    linear("mcm", Dimension::Volume, 1.0e6, &["Mm3", "million_m3"]),
    linear("km3", Dimension::Volume, 1.0e9, &["km^3", "bcm"]),
    linear("m3/s", Dimension::Flow, 1.0, &["cms", "cumecs", "m^3/s"]),
    linear("l/s", Dimension::Flow, 1.0e-3, &["L/s", "lps"]),
    UnitDescriptor {
        symbol: "degC",
        dimension: Dimension::Temperature,
        scale: 1.0,
        offset: 273.15,
        aliases: &["C", "celsius", "°C"],
    },
    UnitDescriptor {
        symbol: "degF",
        dimension: Dimension::Temperature,
        scale: 5.0 / 9.0,
        offset: 459.67 * 5.0 / 9.0,
        aliases: &["F", "fahrenheit", "°F"],
    },
    linear("K", Dimension::Temperature, 1.0, &["kelvin"]),
    linear("fraction", Dimension::Fraction, 1.0, &["ratio", "1"]),
    linear("percent", Dimension::Fraction, 0.01, &["%", "pct"]),
];

static UNITS: Lazy<HashMap<&'static str, &'static UnitDescriptor>> = Lazy::new(|| {
    let mut units = HashMap::new();
    for descriptor in UNIT_TABLE {
        units.insert(descriptor.symbol, descriptor);
        for alias in descriptor.aliases {
            units.insert(*alias, descriptor);
        }
    }
    units
});

pub fn all_units() -> &'static [UnitDescriptor] {
    UNIT_TABLE
}

pub fn lookup(unit: &str) -> Option<&'static UnitDescriptor> {
    UNITS.get(unit.trim()).copied()
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum UnitError {
    #[error("unknown unit `{0}`")]
    Unknown(String),

    #[error("cannot convert `{from}` to `{to}`: incompatible dimensions")]
    Incompatible { from: String, to: String },
}

/// Converts `value` between two units of the same dimension. Identical unit
/// strings convert trivially even when the table does not know them, so
/// dimensionless indicators (indices, counts) pass through.
pub fn convert(value: f64, from: &str, to: &str) -> Result<f64, UnitError> {
    if from.trim() == to.trim() {
        return Ok(value);
    }
    let source = lookup(from).ok_or_else(|| UnitError::Unknown(from.to_string()))?;
    let target = lookup(to).ok_or_else(|| UnitError::Unknown(to.to_string()))?;
    if source.dimension != target.dimension {
        return Err(UnitError::Incompatible {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    if source.symbol == target.symbol {
        return Ok(value);
    }
    let base = value * source.scale + source.offset;
    Ok((base - target.offset) / target.scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn converts_lengths_and_volumes() {
        assert!(close(convert(0.4, "cm", "mm").unwrap(), 4.0));
        assert!(close(convert(2.0, "in", "mm").unwrap(), 50.8));
        assert!(close(convert(1.25, "mcm", "m3").unwrap(), 1_250_000.0));
        assert!(close(convert(500.0, "l/s", "m3/s").unwrap(), 0.5));
    }

    #[test]
    fn converts_temperatures_with_offsets() {
        assert!(close(convert(0.0, "degC", "K").unwrap(), 273.15));
        assert!(close(convert(212.0, "degF", "degC").unwrap(), 100.0));
        assert!(close(convert(37.0, "°C", "celsius").unwrap(), 37.0));
    }

    #[test]
    fn aliases_resolve_to_the_same_unit() {
        assert!(close(convert(5.0, "millimetre", "mm").unwrap(), 5.0));
        assert!(close(convert(50.0, "%", "fraction").unwrap(), 0.5));
    }

    #[test]
    fn rejects_unknown_and_incompatible_units() {
        assert_eq!(
            convert(1.0, "furlong", "mm"),
            Err(UnitError::Unknown("furlong".into()))
        );
        assert!(matches!(
            convert(1.0, "mm", "m3"),
            Err(UnitError::Incompatible { .. })
        ));
        assert_eq!(convert(3.0, "index", "index"), Ok(3.0));
    }
}
