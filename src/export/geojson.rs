//! GeoJSON feature collections.
//!
//! Features take their geometry from the table's geometry column. Tables
//! without one but with latitude and longitude columns get a synthesized
//! `Point`.

use serde_json::{json, Value};

use super::json::project;
use super::{BoundingBox, ExportData, ExportError, ExportFile, ExportFormat, ExportWriter};
use crate::model::Row;
use crate::schema::TableDescriptor;

const LATITUDE: &[&str] = &["lat", "latitude"];
const LONGITUDE: &[&str] = &["lon", "lng", "long", "longitude"];

/// Where a table keeps its location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Geometry(String),
    LatLon { lat: String, lon: String },
}

impl Locator {
    /// The geometry column wins over latitude/longitude.
    pub fn for_table(descriptor: &TableDescriptor) -> Option<Self> {
        if let Some(column) = descriptor.geometry_column() {
            return Some(Locator::Geometry(column.name.clone()));
        }
        let find = |names: &[&str]| {
            descriptor
                .columns
                .iter()
                .find(|c| names.contains(&c.name.to_ascii_lowercase().as_str()))
                .map(|c| c.name.clone())
        };
        Some(Locator::LatLon {
            lat: find(LATITUDE)?,
            lon: find(LONGITUDE)?,
        })
    }

    /// GeoJSON geometry of `row`, if it has one.
    pub fn geometry(&self, row: &Row) -> Option<Value> {
        match self {
            Locator::Geometry(column) => match row.get(column)? {
                Value::Object(o) if o.contains_key("type") => Some(Value::Object(o.clone())),
                Value::String(s) => wkt_point(s).map(|(x, y)| point(x, y)),
                _ => None,
            },
            Locator::LatLon { lat, lon } => {
                let lat = number(row.get(lat)?)?;
                let lon = number(row.get(lon)?)?;
                Some(point(lon, lat))
            }
        }
    }

    /// Bounds of the row's geometry.
    pub fn envelope(&self, row: &Row) -> Option<BoundingBox> {
        let geometry = self.geometry(row)?;
        let mut positions = Vec::new();
        collect_positions(geometry.get("coordinates")?, &mut positions);
        let (first, rest) = positions.split_first()?;
        let mut bbox = BoundingBox::new(first.0, first.1, first.0, first.1);
        for (x, y) in rest {
            bbox.min_lon = bbox.min_lon.min(*x);
            bbox.min_lat = bbox.min_lat.min(*y);
            bbox.max_lon = bbox.max_lon.max(*x);
            bbox.max_lat = bbox.max_lat.max(*y);
        }
        Some(bbox)
    }

    fn column(&self) -> Option<&str> {
        match self {
            Locator::Geometry(column) => Some(column),
            Locator::LatLon { .. } => None,
        }
    }
}

fn point(x: f64, y: f64) -> Value {
    json!({ "type": "Point", "coordinates": [x, y] })
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn wkt_point(s: &str) -> Option<(f64, f64)> {
    let upper = s.trim().to_ascii_uppercase();
    let inner = upper
        .strip_prefix("POINT")?
        .trim()
        .strip_prefix('(')?
        .strip_suffix(')')?;
    let mut parts = inner.split_whitespace();
    let x = parts.next()?.parse().ok()?;
    let y = parts.next()?.parse().ok()?;
    Some((x, y))
}

/// Flatten nested coordinate arrays into `(x, y)` positions.
fn collect_positions(value: &Value, out: &mut Vec<(f64, f64)>) {
    let Value::Array(items) = value else {
        return;
    };
    match (items.first().and_then(Value::as_f64), items.get(1).and_then(Value::as_f64)) {
        (Some(x), Some(y)) => out.push((x, y)),
        _ => {
            for item in items {
                collect_positions(item, out);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GeoJsonWriter;

impl ExportWriter for GeoJsonWriter {
    fn format(&self) -> ExportFormat {
        ExportFormat::GeoJson
    }

    fn write(&self, data: &ExportData<'_>) -> Result<Vec<ExportFile>, ExportError> {
        let locator = Locator::for_table(data.descriptor)
            .ok_or_else(|| ExportError::NoGeometry(data.descriptor.name.clone()))?;
        let properties: Vec<String> = data
            .metadata
            .columns
            .iter()
            .filter(|c| Some(c.as_str()) != locator.column())
            .cloned()
            .collect();

        let features: Vec<Value> = data
            .rows
            .iter()
            .map(|(key, row)| {
                json!({
                    "type": "Feature",
                    "id": key.to_string(),
                    "geometry": locator.geometry(row),
                    "properties": project(row, &properties),
                })
            })
            .collect();
        let document = json!({
            "type": "FeatureCollection",
            "metadata": data.metadata,
            "features": features,
        });
        Ok(vec![ExportFile::new(
            format!("{}.geojson", data.metadata.table),
            "application/geo+json",
            serde_json::to_vec_pretty(&document)?,
        )])
    }
}
