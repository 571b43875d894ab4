//! Derived layer pipelines
//!
//! A pipeline holds named raw rasters ("sources") and named derived layers.
//! Each derived layer declares the names it depends on and a pure formula
//! computing it from those dependencies. The dependency graph is validated
//! when the pipeline is built; layers are then evaluated lazily, each at
//! most once, and cached for the lifetime of the pipeline.
//!
//! # Example
//! ```ignore
//! let mut pipeline = Pipeline::builder()
//!     .add_source("early", RasterGrid::load("scene_2020.tif")?)
//!     .add_source("late", RasterGrid::load("scene_2021.tif")?)
//!     .add_formula_layer("ndvi_early", "(early[3] - early[2]) / (early[3] + early[2])")
//!     .add_formula_layer("ndvi_late", "(late[3] - late[2]) / (late[3] + late[2])")
//!     .add_formula_layer("change", "(ndvi_late - ndvi_early) / ndvi_early * 100")
//!     .build()?;
//!
//! let change = pipeline.evaluate("change")?;
//! ```

mod config;

pub use config::{write_output, LayerSpec, OutputSpec, PipelineConfig};

use crate::algebra::{Expression, NumericPolicy};
use bandstack_core::{Error, Layer, LayerView, RasterGrid, RasterMetadata, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

/// Formula of a derived layer: receives its dependencies as operands, in
/// the order they were declared.
pub type LayerFormula = Box<dyn Fn(&[LayerView<'_>]) -> Result<Layer> + Send + Sync>;

/// A named layer computed from other layers or sources.
pub struct DerivedLayer {
    name: String,
    depends_on: Vec<String>,
    formula: LayerFormula,
}

impl DerivedLayer {
    pub fn new<F>(name: impl Into<String>, depends_on: &[&str], formula: F) -> Self
    where
        F: Fn(&[LayerView<'_>]) -> Result<Layer> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            formula: Box::new(formula),
        }
    }

    /// A layer whose formula is an [`Expression`].
    ///
    /// Every referenced name that is not in `constants` becomes a
    /// dependency, in order of first appearance.
    pub fn from_expression(
        name: impl Into<String>,
        expression: Expression,
        constants: BTreeMap<String, f64>,
        policy: NumericPolicy,
    ) -> Self {
        let depends_on: Vec<String> = expression
            .variables()
            .iter()
            .filter(|v| !constants.contains_key(*v))
            .cloned()
            .collect();
        let names = depends_on.clone();

        Self {
            name: name.into(),
            depends_on,
            formula: Box::new(move |inputs: &[LayerView<'_>]| {
                let operands: Vec<(&str, LayerView<'_>)> = names
                    .iter()
                    .map(String::as_str)
                    .zip(inputs.iter().copied())
                    .collect();
                expression.evaluate(&operands, &constants, policy)
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }
}

impl fmt::Debug for DerivedLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedLayer")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}

/// Collects sources, constants and layer declarations for a [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    sources: Vec<(String, RasterGrid)>,
    layers: Vec<DerivedLayer>,
    formulas: Vec<(String, String)>,
    constants: BTreeMap<String, f64>,
    policy: NumericPolicy,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw raster under `name`. The first source registered
    /// provides the georeferencing of [`Pipeline::grid`].
    pub fn add_source(mut self, name: impl Into<String>, grid: RasterGrid) -> Self {
        self.sources.push((name.into(), grid));
        self
    }

    pub fn add_layer(mut self, layer: DerivedLayer) -> Self {
        self.layers.push(layer);
        self
    }

    /// Declare a layer from formula text. Its dependencies are the names
    /// the formula references that are not constants. The formula is
    /// parsed when the pipeline is built.
    pub fn add_formula_layer(mut self, name: impl Into<String>, formula: impl Into<String>) -> Self {
        self.formulas.push((name.into(), formula.into()));
        self
    }

    /// Named scalar available to formula layers
    pub fn add_constant(mut self, name: impl Into<String>, value: f64) -> Self {
        self.constants.insert(name.into(), value);
        self
    }

    /// Numeric policy used by formula layers
    pub fn policy(mut self, policy: NumericPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Validate the declarations and build the pipeline.
    ///
    /// Fails with `DuplicateLayer` when a name is declared twice (sources,
    /// layers and constants share one namespace), `Formula` when a formula
    /// does not parse, `UnknownLayer` when a dependency is not declared and
    /// `CyclicDependency` when the graph has a cycle. No formula runs here.
    pub fn build(self) -> Result<Pipeline> {
        let PipelineBuilder {
            sources,
            mut layers,
            formulas,
            constants,
            policy,
        } = self;

        for (name, formula) in formulas {
            let expression = Expression::parse(&formula)
                .map_err(|e| Error::Formula(format!("layer '{}': {}", name, e)))?;
            layers.push(DerivedLayer::from_expression(
                name,
                expression,
                constants.clone(),
                policy,
            ));
        }

        let template = sources.first().map(|(_, grid)| grid.metadata().clone());
        let mut names = BTreeSet::new();
        let mut source_map = BTreeMap::new();
        for (name, grid) in sources {
            if !names.insert(name.clone()) {
                return Err(Error::DuplicateLayer(name));
            }
            source_map.insert(name, grid);
        }
        let mut layer_map = BTreeMap::new();
        for layer in layers {
            if !names.insert(layer.name.clone()) {
                return Err(Error::DuplicateLayer(layer.name));
            }
            layer_map.insert(layer.name.clone(), layer);
        }
        if let Some(name) = constants.keys().find(|c| names.contains(*c)) {
            return Err(Error::DuplicateLayer(name.clone()));
        }

        let pipeline = Pipeline {
            sources: source_map,
            layers: layer_map,
            constants,
            policy,
            template,
            cache: BTreeMap::new(),
        };

        // Walking every layer once surfaces unknown names and cycles
        let mut visited = BTreeSet::new();
        for name in pipeline.layers.keys() {
            let mut order = Vec::new();
            pipeline.visit(name, &mut visited, &mut Vec::new(), &mut order)?;
        }

        debug!(
            sources = pipeline.sources.len(),
            layers = pipeline.layers.len(),
            "built pipeline"
        );
        Ok(pipeline)
    }
}

/// Validated dependency graph of sources and derived layers, with a cache
/// of evaluated layers.
///
/// All maps are ordered, so evaluation is deterministic.
pub struct Pipeline {
    sources: BTreeMap<String, RasterGrid>,
    layers: BTreeMap<String, DerivedLayer>,
    constants: BTreeMap<String, f64>,
    policy: NumericPolicy,
    template: Option<RasterMetadata>,
    cache: BTreeMap<String, Layer>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Evaluate layer `name`, computing each missing dependency exactly once.
    ///
    /// The full resolution order is computed before the first formula runs,
    /// so an unknown name or a cycle is reported without side effects.
    /// Results stay cached until [`clear_cache`](Self::clear_cache).
    /// Evaluating a source returns its pixels as a stack.
    pub fn evaluate(&mut self, name: &str) -> Result<&Layer> {
        let order = self.resolution_order(name)?;

        for node in &order {
            if self.cache.contains_key(node) {
                continue;
            }
            // Sources are read in place unless they are the target
            if self.sources.contains_key(node) && node != name {
                continue;
            }

            let layer = if let Some(grid) = self.sources.get(node) {
                Layer::Stack(grid.pixels().to_owned())
            } else {
                let def = self
                    .layers
                    .get(node)
                    .ok_or_else(|| Error::UnknownLayer(node.clone()))?;

                let mut inputs = Vec::with_capacity(def.depends_on.len());
                for dep in &def.depends_on {
                    let view = match self.sources.get(dep) {
                        Some(grid) => LayerView::from(grid),
                        None => self
                            .cache
                            .get(dep)
                            .map(LayerView::from)
                            .ok_or_else(|| Error::UnknownLayer(dep.clone()))?,
                    };
                    inputs.push(view);
                }

                let layer = (def.formula)(inputs.as_slice())?;
                debug!(layer = %node, shape = ?layer.shape(), "evaluated layer");
                layer
            };

            self.cache.insert(node.clone(), layer);
        }

        self.cache
            .get(name)
            .ok_or_else(|| Error::UnknownLayer(name.to_string()))
    }

    /// Evaluate `name` and wrap it as a grid georeferenced like the first
    /// source of the pipeline.
    pub fn grid(&mut self, name: &str) -> Result<RasterGrid> {
        let template = self.template.clone().ok_or_else(|| {
            Error::Other("pipeline has no source to take georeferencing from".into())
        })?;
        let layer = self.evaluate(name)?.clone();
        RasterGrid::from_layer(layer, &template)
    }

    /// Names `name` depends on directly (empty for sources)
    pub fn dependencies(&self, name: &str) -> Result<&[String]> {
        if self.sources.contains_key(name) {
            return Ok(&[]);
        }
        self.layers
            .get(name)
            .map(|l| l.depends_on.as_slice())
            .ok_or_else(|| Error::UnknownLayer(name.to_string()))
    }

    /// All declared names (sources and layers), sorted
    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        let mut names: Vec<&str> = self
            .sources
            .keys()
            .chain(self.layers.keys())
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names.into_iter()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name) || self.layers.contains_key(name)
    }

    pub fn source(&self, name: &str) -> Option<&RasterGrid> {
        self.sources.get(name)
    }

    /// Georeferencing profile of the first source
    pub fn template(&self) -> Option<&RasterMetadata> {
        self.template.as_ref()
    }

    pub fn constants(&self) -> &BTreeMap<String, f64> {
        &self.constants
    }

    pub fn policy(&self) -> NumericPolicy {
        self.policy
    }

    pub fn is_cached(&self, name: &str) -> bool {
        self.cache.contains_key(name)
    }

    /// Drop every cached result
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Dependencies-first order of every node `target` needs that is not
    /// cached yet, ending with `target` itself.
    fn resolution_order(&self, target: &str) -> Result<Vec<String>> {
        let mut order = Vec::new();
        self.visit(target, &mut BTreeSet::new(), &mut Vec::new(), &mut order)?;
        Ok(order)
    }

    fn visit(
        &self,
        name: &str,
        visited: &mut BTreeSet<String>,
        stack: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        if visited.contains(name) || self.cache.contains_key(name) {
            return Ok(());
        }
        if let Some(pos) = stack.iter().position(|n| n == name) {
            let mut cycle = stack[pos..].to_vec();
            cycle.push(name.to_string());
            return Err(Error::CyclicDependency(cycle));
        }

        if !self.sources.contains_key(name) {
            let layer = self
                .layers
                .get(name)
                .ok_or_else(|| Error::UnknownLayer(name.to_string()))?;

            stack.push(name.to_string());
            for dep in &layer.depends_on {
                self.visit(dep, visited, stack, order)?;
            }
            stack.pop();
        }

        visited.insert(name.to_string());
        order.push(name.to_string());
        Ok(())
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("layers", &self.layers.values().collect::<Vec<_>>())
            .field("constants", &self.constants)
            .field("policy", &self.policy)
            .field("cached", &self.cache.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::normalized_difference;
    use approx::assert_relative_eq;
    use bandstack_core::{GeoTransform, CRS};
    use ndarray::Array3;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn scene(value: f64) -> RasterGrid {
        let pixels = Array3::from_shape_fn((4, 3, 3), |(b, _, _)| value * (b + 1) as f64);
        let meta = RasterMetadata::new(4, 3, 3)
            .with_crs(CRS::from_epsg(32633))
            .with_transform(GeoTransform::new(0.0, 30.0, 10.0, -10.0));
        RasterGrid::new(pixels, meta).unwrap()
    }

    fn counting_layer(name: &str, deps: &[&str], counter: Arc<AtomicUsize>) -> DerivedLayer {
        DerivedLayer::new(name, deps, move |inputs| {
            counter.fetch_add(1, Ordering::SeqCst);
            normalized_difference(inputs[0], inputs[1], NumericPolicy::default())
        })
    }

    #[test]
    fn test_evaluate_is_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::builder()
            .add_source("a", scene(2.0))
            .add_source("b", scene(1.0))
            .add_layer(counting_layer("x", &["a", "b"], calls.clone()))
            .build()
            .unwrap();

        let first = pipeline.evaluate("x").unwrap().clone();
        let second = pipeline.evaluate("x").unwrap().clone();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_relative_eq!(first.band(0).unwrap()[(0, 0)], 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_shared_dependency_computed_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::builder()
            .add_source("a", scene(2.0))
            .add_source("b", scene(1.0))
            .add_layer(counting_layer("x", &["a", "b"], calls.clone()))
            .add_layer(counting_layer("y", &["x", "x"], calls.clone()))
            .add_layer(counting_layer("z", &["x", "y"], calls.clone()))
            .build()
            .unwrap();

        pipeline.evaluate("z").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(pipeline.is_cached("x") && pipeline.is_cached("y"));

        pipeline.clear_cache();
        pipeline.evaluate("x").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_cycle_detected_before_any_formula_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = Pipeline::builder()
            .add_source("a", scene(1.0))
            .add_layer(counting_layer("x", &["y", "a"], calls.clone()))
            .add_layer(counting_layer("y", &["x", "a"], calls.clone()))
            .build();

        match result {
            Err(Error::CyclicDependency(path)) => {
                assert_eq!(path.first(), path.last());
                assert!(path.contains(&"x".to_string()) && path.contains(&"y".to_string()));
            }
            other => panic!("expected a cycle, got {:?}", other.map(|_| ())),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unknown_dependency_and_name() {
        let result = Pipeline::builder()
            .add_source("a", scene(1.0))
            .add_formula_layer("x", "a - missing")
            .build();
        assert!(matches!(result, Err(Error::UnknownLayer(name)) if name == "missing"));

        let mut pipeline = Pipeline::builder().add_source("a", scene(1.0)).build().unwrap();
        assert!(matches!(pipeline.evaluate("nope"), Err(Error::UnknownLayer(_))));
    }

    #[test]
    fn test_duplicate_names() {
        let result = Pipeline::builder()
            .add_source("a", scene(1.0))
            .add_formula_layer("a", "a * 2")
            .build();
        assert!(matches!(result, Err(Error::DuplicateLayer(name)) if name == "a"));

        let result = Pipeline::builder()
            .add_source("a", scene(1.0))
            .add_constant("a", 2.0)
            .build();
        assert!(matches!(result, Err(Error::DuplicateLayer(_))));
    }

    #[test]
    fn test_formula_layers_with_constants() {
        let mut pipeline = Pipeline::builder()
            .add_source("x", scene(3.0))
            .add_source("y", scene(1.0))
            .add_constant("p", 2.0)
            .add_constant("c", 0.5)
            .add_formula_layer("ratio", "(1 + p*c + x) / (y + p + c)")
            .add_formula_layer("ndi", "(x[0] - y[0]) / (x[0] + y[0])")
            .add_formula_layer("change", "(ndi - ndi) / ndi * 100")
            .build()
            .unwrap();

        assert_eq!(pipeline.dependencies("ratio").unwrap(), ["x", "y"]);
        assert_eq!(pipeline.dependencies("change").unwrap(), ["ndi"]);

        let ratio = pipeline.evaluate("ratio").unwrap();
        assert!(ratio.is_stack());
        // band 0: x = 3, y = 1
        assert_relative_eq!(ratio.band(0).unwrap()[(1, 1)], 5.0 / 3.5, epsilon = 1e-12);

        let ndi = pipeline.evaluate("ndi").unwrap();
        assert!(!ndi.is_stack());
        assert_relative_eq!(ndi.band(0).unwrap()[(0, 0)], 0.5, epsilon = 1e-12);

        let change = pipeline.evaluate("change").unwrap();
        assert!(change.values().all(|v| v == 0.0));
    }

    #[test]
    fn test_bad_formula_fails_build() {
        let result = Pipeline::builder()
            .add_source("a", scene(1.0))
            .add_formula_layer("x", "(a +")
            .build();
        assert!(matches!(result, Err(Error::Formula(_))));
    }

    #[test]
    fn test_grid_inherits_first_source_metadata() {
        let mut pipeline = Pipeline::builder()
            .add_source("a", scene(2.0))
            .add_source("b", scene(1.0))
            .add_formula_layer("ndi", "(a[3] - b[3]) / (a[3] + b[3])")
            .build()
            .unwrap();

        let grid = pipeline.grid("ndi").unwrap();
        assert_eq!(grid.shape(), (1, 3, 3));
        assert_eq!(grid.crs(), Some(&CRS::from_epsg(32633)));
        assert_eq!(grid.transform(), &GeoTransform::new(0.0, 30.0, 10.0, -10.0));
    }

    #[test]
    fn test_template_is_first_registered_source() {
        let (pixels, meta) = scene(1.0).into_parts();
        let shifted = RasterGrid::new(
            pixels,
            meta.with_transform(GeoTransform::new(500.0, 30.0, 10.0, -10.0)),
        )
        .unwrap();

        let mut pipeline = Pipeline::builder()
            .add_source("z", shifted)
            .add_source("a", scene(2.0))
            .add_formula_layer("sum", "z + a")
            .build()
            .unwrap();

        assert_eq!(pipeline.template().unwrap().transform.origin_x, 500.0);
        assert_eq!(pipeline.grid("sum").unwrap().transform().origin_x, 500.0);
    }

    #[test]
    fn test_layer_names_sorted() {
        let pipeline = Pipeline::builder()
            .add_source("b", scene(1.0))
            .add_source("a", scene(1.0))
            .add_formula_layer("c", "a + b")
            .build()
            .unwrap();
        assert_eq!(pipeline.layer_names().collect::<Vec<_>>(), ["a", "b", "c"]);
        assert!(pipeline.dependencies("a").unwrap().is_empty());
    }

    #[test]
    fn test_source_evaluates_to_stack() {
        let mut pipeline = Pipeline::builder().add_source("a", scene(1.0)).build().unwrap();
        let layer = pipeline.evaluate("a").unwrap();
        assert_eq!(layer.shape(), (4, 3, 3));
    }
}
