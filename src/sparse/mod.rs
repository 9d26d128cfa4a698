/*
    Nyx, blazing fast astrodynamics
    Copyright (C) 2023 Christopher Rabotin <christopher.rabotin@gmail.com>

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use crate::errors::{ConfigError, SizeMismatchSnafu};
use crate::linalg::{DMatrix, DVector};
use snafu::ensure;
use sprs::{CsMat, TriMat};
use std::collections::HashMap;
use std::fmt;

/// An ordered set of zero-based (row, column) positions.
///
/// Insertion order is preserved and duplicated positions are only stored once, so the pattern
/// can be computed once per mesh and the values refreshed at every evaluation through
/// [`SparsityPattern::position`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SparsityPattern {
    nrows: usize,
    ncols: usize,
    rows: Vec<usize>,
    cols: Vec<usize>,
    lookup: HashMap<(usize, usize), usize>,
}

impl SparsityPattern {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            ..Default::default()
        }
    }

    /// Inserts a position if it isn't already present, and returns its index in the pattern.
    pub fn insert(&mut self, row: usize, col: usize) -> usize {
        debug_assert!(row < self.nrows, "row {row} >= {}", self.nrows);
        debug_assert!(col < self.ncols, "col {col} >= {}", self.ncols);
        if let Some(pos) = self.lookup.get(&(row, col)) {
            return *pos;
        }
        let pos = self.rows.len();
        self.rows.push(row);
        self.cols.push(col);
        self.lookup.insert((row, col), pos);
        pos
    }

    /// Inserts every position of `other`, offset by the provided row and column.
    pub fn insert_block(&mut self, row_offset: usize, col_offset: usize, other: &Self) {
        for (r, c) in other.iter() {
            self.insert(r + row_offset, c + col_offset);
        }
    }

    /// Inserts the lower triangle (including the diagonal) of the dense block spanned by `indices`.
    pub fn insert_lower_triangle(&mut self, indices: &[usize]) {
        for &i in indices {
            for &j in indices {
                if j <= i {
                    self.insert(i, j);
                }
            }
        }
    }

    pub fn position(&self, row: usize, col: usize) -> Option<usize> {
        self.lookup.get(&(row, col)).copied()
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.lookup.contains_key(&(row, col))
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.rows.iter().copied().zip(self.cols.iter().copied())
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn cols(&self) -> &[usize] {
        &self.cols
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Number of structural non-zeros
    pub fn nnz(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A sparse matrix in coordinate (triplet) form with zero-based indices.
///
/// Entries in the same cell are allowed and are summed by every conversion.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TripletMatrix {
    nrows: usize,
    ncols: usize,
    rows: Vec<usize>,
    cols: Vec<usize>,
    values: Vec<f64>,
}

impl TripletMatrix {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            ..Default::default()
        }
    }

    /// Pairs a cached pattern with freshly computed values.
    pub fn from_pattern(pattern: &SparsityPattern, values: Vec<f64>) -> Result<Self, ConfigError> {
        ensure!(
            values.len() == pattern.nnz(),
            SizeMismatchSnafu {
                left: "sparsity pattern",
                left_len: pattern.nnz(),
                right: "values",
                right_len: values.len(),
            }
        );
        Ok(Self {
            nrows: pattern.nrows(),
            ncols: pattern.ncols(),
            rows: pattern.rows().to_vec(),
            cols: pattern.cols().to_vec(),
            values,
        })
    }

    /// Keeps every entry whose magnitude is strictly greater than `drop_tol`.
    pub fn from_dense(dense: &DMatrix<f64>, drop_tol: f64) -> Self {
        let mut me = Self::new(dense.nrows(), dense.ncols());
        me.set_block(0, 0, dense, drop_tol);
        me
    }

    pub fn push(&mut self, row: usize, col: usize, value: f64) {
        debug_assert!(row < self.nrows && col < self.ncols);
        self.rows.push(row);
        self.cols.push(col);
        self.values.push(value);
    }

    /// Appends the entries of a dense block at the provided offset, skipping negligible entries.
    pub fn set_block(
        &mut self,
        row_offset: usize,
        col_offset: usize,
        block: &DMatrix<f64>,
        drop_tol: f64,
    ) {
        for j in 0..block.ncols() {
            for i in 0..block.nrows() {
                let value = block[(i, j)];
                if value.abs() > drop_tol {
                    self.push(i + row_offset, j + col_offset, value);
                }
            }
        }
    }

    /// Returns the sum of all the entries stored at that position, or zero.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.iter()
            .filter(|(r, c, _)| *r == row && *c == col)
            .map(|(_, _, v)| v)
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.rows
            .iter()
            .zip(self.cols.iter())
            .zip(self.values.iter())
            .map(|((r, c), v)| (*r, *c, *v))
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.nrows, self.ncols);
        for (r, c, v) in self.iter() {
            dense[(r, c)] += v;
        }
        dense
    }

    /// Builds the compressed sparse column representation, summing duplicates.
    pub fn to_csc(&self) -> CsMat<f64> {
        let mut tri = TriMat::new((self.nrows, self.ncols));
        for (r, c, v) in self.iter() {
            tri.add_triplet(r, c, v);
        }
        tri.to_csc()
    }

    /// Computes `A * x`.
    pub fn mul_vector(&self, x: &[f64]) -> DVector<f64> {
        debug_assert_eq!(x.len(), self.ncols);
        let mut y = DVector::zeros(self.nrows);
        for (r, c, v) in self.iter() {
            y[r] += v * x[c];
        }
        y
    }

    /// Computes `A^T * y`.
    pub fn transpose_mul_vector(&self, y: &[f64]) -> DVector<f64> {
        debug_assert_eq!(y.len(), self.nrows);
        let mut x = DVector::zeros(self.ncols);
        for (r, c, v) in self.iter() {
            x[c] += v * y[r];
        }
        x
    }

    /// Sum of the absolute values of all entries.
    pub fn sum_abs(&self) -> f64 {
        self.values.iter().map(|v| v.abs()).sum()
    }

    /// Returns true if no summed entry exceeds `tol` in magnitude.
    pub fn is_zero(&self, tol: f64) -> bool {
        let mut summed: HashMap<(usize, usize), f64> = HashMap::new();
        for (r, c, v) in self.iter() {
            *summed.entry((r, c)).or_insert(0.0) += v;
        }
        summed.values().all(|v| v.abs() <= tol)
    }

    /// Number of stored entries, duplicates included.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn cols(&self) -> &[usize] {
        &self.cols
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

impl fmt::Display for TripletMatrix {
    /// Prints the non-zero elements, one per line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}x{} with {} entries", self.nrows, self.ncols, self.nnz())?;
        for (r, c, v) in self.iter() {
            if v != 0.0 {
                writeln!(f, "({r}, {c}) = {v:e}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod ut_sparse {
    use super::*;

    #[test]
    fn pattern_dedup_and_order() {
        let mut p = SparsityPattern::new(3, 3);
        assert_eq!(p.insert(2, 1), 0);
        assert_eq!(p.insert(0, 0), 1);
        assert_eq!(p.insert(2, 1), 0);
        assert_eq!(p.nnz(), 2);
        assert_eq!(p.rows(), &[2, 0]);
        assert_eq!(p.cols(), &[1, 0]);
        p.insert_lower_triangle(&[0, 2]);
        assert!(p.contains(2, 0));
        assert!(p.contains(2, 2));
        assert!(!p.contains(0, 2));
    }

    #[test]
    fn triplet_conversions() {
        let mut t = TripletMatrix::new(2, 3);
        t.push(0, 0, 1.0);
        t.push(1, 2, -2.0);
        t.push(1, 2, 5.0);
        let dense = t.to_dense();
        assert_eq!(dense[(1, 2)], 3.0);
        assert_eq!(t.get(1, 2), 3.0);

        let csc = t.to_csc();
        assert_eq!(csc.nnz(), 2);
        assert_eq!(csc.get(1, 2).copied(), Some(3.0));

        let y = t.mul_vector(&[1.0, 1.0, 2.0]);
        assert_eq!(y.as_slice(), &[1.0, 6.0]);
        let x = t.transpose_mul_vector(&[1.0, 1.0]);
        assert_eq!(x.as_slice(), &[1.0, 0.0, 3.0]);
        assert_eq!(t.sum_abs(), 8.0);
        assert!(!t.is_zero(1e-12));

        let back = TripletMatrix::from_dense(&dense, 0.0);
        assert_eq!(back.nnz(), 2);
        assert_eq!(back.to_dense(), dense);
    }

    #[test]
    fn block_insertion() {
        let block = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 4.0]);
        let mut t = TripletMatrix::new(4, 4);
        t.set_block(2, 1, &block, 0.0);
        assert_eq!(t.nnz(), 2);
        assert_eq!(t.get(2, 1), 1.0);
        assert_eq!(t.get(3, 2), 4.0);

        let mut cancel = TripletMatrix::new(1, 1);
        cancel.push(0, 0, 1.0);
        cancel.push(0, 0, -1.0);
        assert!(cancel.is_zero(0.0));
    }

    #[test]
    fn pattern_size_check() {
        let mut p = SparsityPattern::new(2, 2);
        p.insert(0, 1);
        assert!(TripletMatrix::from_pattern(&p, vec![1.0, 2.0]).is_err());
        let t = TripletMatrix::from_pattern(&p, vec![7.0]).unwrap();
        assert_eq!(t.get(0, 1), 7.0);
    }
}
