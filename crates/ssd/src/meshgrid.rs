use itertools::Itertools;
use ndarray::{Array, Array1, ArrayD, IxDyn};

use crate::error::Result;

/// Generate coordinate grids from a list of 1D arrays.
///
/// This is like numpy's meshgrid function with matrix (`ij`) indexing, but for ndarray. With
/// inputs of lengths `(rows, cols)`, both grids have shape `(rows, cols)` and `grids[0][[r, c]]`
/// is `xi[0][r]`, `grids[1][[r, c]]` is `xi[1][c]`.
pub fn meshgrid<T>(xi: &[Array1<T>]) -> Result<Vec<ArrayD<T>>>
where
    T: Copy,
{
    let ndim = xi.len();
    let grid_shape = xi.iter().map(Array1::len).collect_vec();
    let product = xi.iter().map(|x| x.iter()).multi_cartesian_product();

    let mut grids: Vec<ArrayD<T>> = Vec::with_capacity(ndim);

    for dim_index in 0..ndim {
        // the cartesian product is row-major, so picking a single dimension
        // gives the repeated pattern of that axis
        let values: Vec<T> = product.clone().map(|p| *p[dim_index]).collect();

        let grid = Array::from_shape_vec(IxDyn(&grid_shape), values)?;
        grids.push(grid);
    }

    Ok(grids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn ij_indexing() {
        let grids = meshgrid(&[array![0.0, 1.0, 2.0], array![10.0, 20.0]]).unwrap();

        assert_eq!(grids[0].shape(), &[3, 2]);
        assert_eq!(grids[0][[2, 0]], 2.0);
        assert_eq!(grids[0][[2, 1]], 2.0);
        assert_eq!(grids[1][[0, 1]], 20.0);
        assert_eq!(grids[1][[2, 1]], 20.0);
    }

    #[test]
    fn three_inputs_follow_input_order() {
        let grids = meshgrid(&[array![0, 1], array![10, 20, 30], array![7]]).unwrap();

        assert_eq!(grids.len(), 3);
        assert!(grids.iter().all(|grid| grid.shape() == &[2, 3, 1]));
        assert_eq!(grids[0][[1, 2, 0]], 1);
        assert_eq!(grids[1][[1, 2, 0]], 30);
        assert_eq!(grids[2][[0, 1, 0]], 7);
    }
}
