//! Algebra results: band stacks and single bands

use crate::error::{Error, Result};
use crate::raster::RasterGrid;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};

/// Output of a band algebra operation.
///
/// A whole-stack operation yields one output band per input band; a
/// single-band operation yields one 2-D array. The two are kept apart so
/// callers never have to guess which one they got.
#[derive(Debug, Clone, PartialEq)]
pub enum Layer {
    /// `(bands, rows, cols)`
    Stack(Array3<f64>),
    /// `(rows, cols)`
    Band(Array2<f64>),
}

impl Layer {
    /// `(bands, rows, cols)`; a single band reports one band
    pub fn shape(&self) -> (usize, usize, usize) {
        self.view().shape()
    }

    pub fn band_count(&self) -> usize {
        self.shape().0
    }

    pub fn is_stack(&self) -> bool {
        matches!(self, Layer::Stack(_))
    }

    /// Borrow as an algebra operand
    pub fn view(&self) -> LayerView<'_> {
        match self {
            Layer::Stack(a) => LayerView::Stack(a.view()),
            Layer::Band(a) => LayerView::Band(a.view()),
        }
    }

    /// Band `index` of the layer. A single band only has index 0.
    pub fn band(&self, index: usize) -> Result<ArrayView2<'_, f64>> {
        self.view().band(index)
    }

    /// Promote to a `(bands, rows, cols)` array, consuming the layer
    pub fn into_stack(self) -> Array3<f64> {
        match self {
            Layer::Stack(a) => a,
            Layer::Band(a) => a.insert_axis(Axis(0)),
        }
    }

    /// Iterate over every cell value, band by band in row-major order
    pub fn values(&self) -> Box<dyn Iterator<Item = f64> + '_> {
        match self {
            Layer::Stack(a) => Box::new(a.iter().copied()),
            Layer::Band(a) => Box::new(a.iter().copied()),
        }
    }
}

/// Borrowed algebra operand: a raw grid, a derived layer, or a plain array.
#[derive(Debug, Clone, Copy)]
pub enum LayerView<'a> {
    Stack(ArrayView3<'a, f64>),
    Band(ArrayView2<'a, f64>),
}

impl<'a> LayerView<'a> {
    /// `(bands, rows, cols)`; a single band reports one band
    pub fn shape(&self) -> (usize, usize, usize) {
        match self {
            LayerView::Stack(a) => a.dim(),
            LayerView::Band(a) => {
                let (rows, cols) = a.dim();
                (1, rows, cols)
            }
        }
    }

    pub fn is_stack(&self) -> bool {
        matches!(self, LayerView::Stack(_))
    }

    /// View as `(bands, rows, cols)` without copying
    pub fn as_stack(&self) -> ArrayView3<'a, f64> {
        match *self {
            LayerView::Stack(a) => a,
            LayerView::Band(a) => a.insert_axis(Axis(0)),
        }
    }

    /// Select one band, producing a single-band operand
    pub fn band(&self, index: usize) -> Result<ArrayView2<'a, f64>> {
        let count = self.shape().0;
        if index >= count {
            return Err(Error::BandIndex { index, count });
        }
        Ok(self.as_stack().index_axis_move(Axis(0), index))
    }
}

impl<'a> From<&'a RasterGrid> for LayerView<'a> {
    fn from(grid: &'a RasterGrid) -> Self {
        LayerView::Stack(grid.pixels())
    }
}

impl<'a> From<&'a Layer> for LayerView<'a> {
    fn from(layer: &'a Layer) -> Self {
        layer.view()
    }
}

impl<'a> From<ArrayView2<'a, f64>> for LayerView<'a> {
    fn from(band: ArrayView2<'a, f64>) -> Self {
        LayerView::Band(band)
    }
}

impl<'a> From<ArrayView3<'a, f64>> for LayerView<'a> {
    fn from(stack: ArrayView3<'a, f64>) -> Self {
        LayerView::Stack(stack)
    }
}

impl From<Array2<f64>> for Layer {
    fn from(band: Array2<f64>) -> Self {
        Layer::Band(band)
    }
}

impl From<Array3<f64>> for Layer {
    fn from(stack: Array3<f64>) -> Self {
        Layer::Stack(stack)
    }
}
