//! Lobby settings and the partial-update patch applied to them

use serde::{Deserialize, Deserializer, Serialize};

/// A latitude/longitude pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Bounding box of a custom region
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

/// User-defined play area. Stored and forwarded verbatim, never validated
/// geometrically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomRegion {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bounds: RegionBounds,
    /// Polygons, each an ordered list of `[lat, lon]`
    #[serde(default, deserialize_with = "lenient_paths")]
    pub paths: Vec<Vec<[f64; 2]>>,
    /// Only set for search-based circular regions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center: Option<GeoPoint>,
    /// Radius in km, paired with `center`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
}

/// Game settings controlled by the session owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSettings {
    pub region: String,
    pub mode: String,
    pub map_layers: bool,
    pub show_region: bool,
    pub turn_around: bool,
    pub zoom: bool,
    pub target_original: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_region: Option<CustomRegion>,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            region: "czechia".to_string(),
            mode: "static".to_string(),
            map_layers: true,
            show_region: true,
            turn_around: true,
            zoom: true,
            target_original: true,
            custom_region: None,
        }
    }
}

/// Partial settings update.
///
/// Absent fields leave the current value alone. `customRegion` is
/// three-state: absent keeps it, `null` clears it, an object replaces it
/// wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_layers: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_region: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_around: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_original: Option<bool>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub custom_region: Option<Option<CustomRegion>>,
}

impl SettingsPatch {
    pub fn apply(self, settings: &mut GameSettings) {
        if let Some(region) = self.region {
            settings.region = region;
        }
        if let Some(mode) = self.mode {
            settings.mode = mode;
        }
        if let Some(v) = self.map_layers {
            settings.map_layers = v;
        }
        if let Some(v) = self.show_region {
            settings.show_region = v;
        }
        if let Some(v) = self.turn_around {
            settings.turn_around = v;
        }
        if let Some(v) = self.zoom {
            settings.zoom = v;
        }
        if let Some(v) = self.target_original {
            settings.target_original = v;
        }
        if let Some(custom_region) = self.custom_region {
            settings.custom_region = custom_region;
        }
    }
}

/// Marks a field as present, so `null` becomes `Some(None)` instead of
/// collapsing into "absent".
fn present<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Points keep their first two numbers; anything shorter is skipped.
fn lenient_paths<'de, D>(deserializer: D) -> Result<Vec<Vec<[f64; 2]>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<Vec<Vec<f64>>>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|path| {
            path.into_iter()
                .filter_map(|point| match point[..] {
                    [lat, lon, ..] => Some([lat, lon]),
                    _ => None,
                })
                .collect()
        })
        .collect())
}
