//! Run configuration.
//!
//! Every constant the dataset generator depends on lives in
//! [`SimulationConfig`]. It is built once at startup, optionally patched from a
//! JSON file, and handed to each stage by reference.

use std::path::Path;

use json::JsonValue;
use nalgebra::Vector2;

use crate::{
    datatypes::Vertex,
    error::{FeaError, Result},
    mesher::Diagonal,
};

/// Applied top-boundary displacements of the standard dataset.
pub const DEFAULT_LOAD_STEPS: [f64; 13] = [
    0.0, 0.001, 0.01, 0.1, 0.5, 1.0, 2.0, 4.0, 6.0, 8.0, 10.0, 12.0, 14.0,
];

/// Newton-Raphson policy for each load step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewtonSettings {
    pub max_iterations: usize,
    /// Converged once the free-dof residual norm drops below this.
    pub absolute_tolerance: f64,
    /// ... or below this fraction of the step's initial residual norm.
    pub relative_tolerance: f64,
    /// Step halvings allowed before an iteration is declared failed.
    pub max_line_search: usize,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        NewtonSettings {
            max_iterations: 50,
            absolute_tolerance: 1e-10,
            relative_tolerance: 1e-9,
            max_line_search: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    /// Bottom-left corner of the square domain.
    pub lower: Vertex,
    /// Top-right corner of the square domain.
    pub upper: Vertex,
    /// Pixels per side of the input bitmap.
    pub raster_size: usize,
    /// Modulus of a zero-intensity pixel.
    pub back: f64,
    /// Modulus of a full-intensity (255) pixel.
    pub high: f64,
    pub poisson_ratio: f64,
    pub load_steps: Vec<f64>,
    /// Distance from the top/bottom extents within which dofs count as boundary dofs.
    pub boundary_tolerance: f64,
    pub diagonal: Diagonal,
    pub newton: NewtonSettings,
    pub body_force: Vector2<f64>,
    pub traction: Vector2<f64>,
    /// Also emit the per-step maximum von Mises stress.
    pub write_stress: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            lower: Vertex::new(0.0, 0.0),
            upper: Vertex::new(28.0, 28.0),
            raster_size: 28,
            back: 1.0,
            high: 100.0,
            poisson_ratio: 0.3,
            load_steps: DEFAULT_LOAD_STEPS.to_vec(),
            boundary_tolerance: 1e-4,
            diagonal: Diagonal::RightLeft,
            newton: NewtonSettings::default(),
            body_force: Vector2::zeros(),
            traction: Vector2::zeros(),
            write_stress: false,
        }
    }
}

impl SimulationConfig {
    /// Loads the defaults and overrides any key present in the JSON file.
    pub fn from_json_file(path: &Path) -> Result<SimulationConfig> {
        let input_json = load_input_file(path)?;
        let mut config = SimulationConfig::default();
        apply_overrides(&mut config, &input_json)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects physically or numerically meaningless settings.
    pub fn validate(&self) -> Result<()> {
        let scalars = [
            ("domain corner", self.lower.x),
            ("domain corner", self.lower.y),
            ("domain corner", self.upper.x),
            ("domain corner", self.upper.y),
            ("background modulus", self.back),
            ("high modulus", self.high),
            ("poisson ratio", self.poisson_ratio),
            ("boundary tolerance", self.boundary_tolerance),
            ("body force", self.body_force.x),
            ("body force", self.body_force.y),
            ("traction", self.traction.x),
            ("traction", self.traction.y),
        ];
        for (name, value) in scalars {
            if !value.is_finite() {
                return Err(FeaError::Input(format!("{name} must be finite, got {value}")));
            }
        }
        if let Some(value) = self.load_steps.iter().find(|v| !v.is_finite()) {
            return Err(FeaError::Input(format!(
                "load steps must be finite, got {value}"
            )));
        }
        if !(self.upper.x > self.lower.x && self.upper.y > self.lower.y) {
            return Err(FeaError::Input(
                "domain upper corner must lie above and right of the lower corner".to_owned(),
            ));
        }
        if self.raster_size == 0 {
            return Err(FeaError::Input("raster size must be positive".to_owned()));
        }
        if self.back <= 0.0 {
            return Err(FeaError::Input(
                "background modulus must be positive".to_owned(),
            ));
        }
        if self.high <= self.back {
            return Err(FeaError::Input(
                "high modulus must exceed background modulus".to_owned(),
            ));
        }
        if self.poisson_ratio <= -1.0 || self.poisson_ratio >= 0.5 {
            return Err(FeaError::Input(
                "poisson ratio must be in range (-1, 0.5)".to_owned(),
            ));
        }
        match self.load_steps.first() {
            None => return Err(FeaError::Input("load sequence is empty".to_owned())),
            Some(first) if *first != 0.0 => {
                return Err(FeaError::Input(
                    "load sequence must start at 0 (reference step)".to_owned(),
                ))
            }
            _ => {}
        }
        if self.load_steps.windows(2).any(|w| w[1] < w[0]) {
            return Err(FeaError::Input(
                "load sequence must be non-decreasing".to_owned(),
            ));
        }
        if self.boundary_tolerance <= 0.0 {
            return Err(FeaError::Input(
                "boundary tolerance must be positive".to_owned(),
            ));
        }
        if self.newton.max_iterations == 0 {
            return Err(FeaError::Input(
                "newton max_iterations must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    /// Width and height of one bitmap pixel in domain units.
    pub fn pixel_size(&self) -> (f64, f64) {
        (
            (self.upper.x - self.lower.x) / self.raster_size as f64,
            (self.upper.y - self.lower.y) / self.raster_size as f64,
        )
    }
}

/// Parses the config file into a JsonValue object
fn load_input_file(path: &Path) -> Result<JsonValue> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(err) => {
            return Err(FeaError::Input(format!(
                "Unable to open config file {}: {err}",
                path.display()
            )))
        }
    };

    let input_json = match json::parse(&contents) {
        Ok(j) => j,
        Err(err) => {
            return Err(FeaError::Input(format!(
                "Config file {} is not valid json: {err}",
                path.display()
            )))
        }
    };

    if !input_json.is_object() {
        return Err(FeaError::Input(
            "Config file must contain a json object".to_owned(),
        ));
    }

    Ok(input_json)
}

fn read_f64(input_json: &JsonValue, key: &str) -> Result<Option<f64>> {
    if !input_json.has_key(key) {
        return Ok(None);
    }
    match input_json[key].as_f64() {
        Some(v) => Ok(Some(v)),
        None => Err(FeaError::Input(format!("Bad value for {key} in config"))),
    }
}

fn read_usize(input_json: &JsonValue, key: &str) -> Result<Option<usize>> {
    if !input_json.has_key(key) {
        return Ok(None);
    }
    match input_json[key].as_usize() {
        Some(v) => Ok(Some(v)),
        None => Err(FeaError::Input(format!("Bad value for {key} in config"))),
    }
}

fn read_pair(input_json: &JsonValue, key: &str) -> Result<Option<(f64, f64)>> {
    if !input_json.has_key(key) {
        return Ok(None);
    }
    let value = &input_json[key];
    let parsed = match (value.is_array(), value.len()) {
        (true, 2) => value[0].as_f64().zip(value[1].as_f64()),
        _ => None,
    };
    match parsed {
        Some(pair) => Ok(Some(pair)),
        None => Err(FeaError::Input(format!(
            "{key} in config must be an array of two numbers"
        ))),
    }
}

fn apply_overrides(config: &mut SimulationConfig, input_json: &JsonValue) -> Result<()> {
    if let Some((x, y)) = read_pair(input_json, "lower")? {
        config.lower = Vertex::new(x, y);
    }
    if let Some((x, y)) = read_pair(input_json, "upper")? {
        config.upper = Vertex::new(x, y);
    }
    if let Some(v) = read_usize(input_json, "raster_size")? {
        config.raster_size = v;
    }
    if let Some(v) = read_f64(input_json, "back")? {
        config.back = v;
    }
    if let Some(v) = read_f64(input_json, "high")? {
        config.high = v;
    }
    if let Some(v) = read_f64(input_json, "nu")? {
        config.poisson_ratio = v;
    }
    if let Some(v) = read_f64(input_json, "boundary_tolerance")? {
        config.boundary_tolerance = v;
    }
    if let Some((x, y)) = read_pair(input_json, "body_force")? {
        config.body_force = Vector2::new(x, y);
    }
    if let Some((x, y)) = read_pair(input_json, "traction")? {
        config.traction = Vector2::new(x, y);
    }

    if input_json.has_key("load_steps") {
        let steps = &input_json["load_steps"];
        if !steps.is_array() {
            return Err(FeaError::Input(
                "load_steps in config must be an array".to_owned(),
            ));
        }
        let mut load_steps = Vec::with_capacity(steps.len());
        for step in steps.members() {
            match step.as_f64() {
                Some(v) => load_steps.push(v),
                None => {
                    return Err(FeaError::Input(
                        "load_steps in config must only contain numbers".to_owned(),
                    ))
                }
            }
        }
        config.load_steps = load_steps;
    }

    if input_json.has_key("diagonal") {
        config.diagonal = match input_json["diagonal"].as_str() {
            Some(s) => s.parse()?,
            None => {
                return Err(FeaError::Input(
                    "diagonal in config must be a string".to_owned(),
                ))
            }
        };
    }

    if input_json.has_key("write_stress") {
        config.write_stress = match input_json["write_stress"].as_bool() {
            Some(b) => b,
            None => {
                return Err(FeaError::Input(
                    "write_stress in config must be a boolean".to_owned(),
                ))
            }
        };
    }

    if input_json.has_key("newton") {
        let newton = &input_json["newton"];
        if let Some(v) = read_usize(newton, "max_iterations")? {
            config.newton.max_iterations = v;
        }
        if let Some(v) = read_f64(newton, "absolute_tolerance")? {
            config.newton.absolute_tolerance = v;
        }
        if let Some(v) = read_f64(newton, "relative_tolerance")? {
            config.newton.relative_tolerance = v;
        }
        if let Some(v) = read_usize(newton, "max_line_search")? {
            config.newton.max_line_search = v;
        }
    }

    Ok(())
}
