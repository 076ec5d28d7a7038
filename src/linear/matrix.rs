use super::AssemblyError;
use crate::math::{self as m, Mat3};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// One scalar entry of the global matrix. Duplicate positions are summed.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Triplet {
    pub row: usize,
    pub col: usize,
    pub value: f64,
}

/// A subsystem's segment of the global triplet buffer, restricted to one block.
///
/// Rows and columns are local to the block;
/// they're shifted to global positions on write.
pub struct TripletView<'a> {
    system: &'static str,
    triplets: &'a mut [Triplet],
    row_offset: usize,
    col_offset: usize,
    rows: usize,
    cols: usize,
    written: usize,
}

impl<'a> TripletView<'a> {
    pub(crate) fn new(
        system: &'static str,
        triplets: &'a mut [Triplet],
        (row_offset, rows): (usize, usize),
        (col_offset, cols): (usize, usize),
    ) -> Self {
        Self {
            system,
            triplets,
            row_offset,
            col_offset,
            rows,
            cols,
            written: 0,
        }
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of entries this segment has room for.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.triplets.len()
    }

    #[inline]
    pub fn written(&self) -> usize {
        self.written
    }

    /// Write the next entry.
    pub fn push(&mut self, row: usize, col: usize, value: f64) -> Result<(), AssemblyError> {
        if row >= self.rows || col >= self.cols {
            return Err(AssemblyError::OutOfBlock {
                system: self.system,
                row,
                col,
                rows: self.rows,
                cols: self.cols,
            });
        }
        let capacity = self.triplets.len();
        let slot = self
            .triplets
            .get_mut(self.written)
            .ok_or(AssemblyError::SegmentOverflow {
                system: self.system,
                capacity,
            })?;
        *slot = Triplet {
            row: self.row_offset + row,
            col: self.col_offset + col,
            value,
        };
        self.written += 1;
        Ok(())
    }

    /// Write a 3x3 block with its top left corner at `(row, col)`. Takes 9 entries.
    pub fn push_block3(&mut self, row: usize, col: usize, block: &Mat3) -> Result<(), AssemblyError> {
        for c in 0..3 {
            for r in 0..3 {
                self.push(row + r, col + c, m::entry(block, r, c))?;
            }
        }
        Ok(())
    }
}

/// Square sparse matrix in compressed sparse row form.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CsrMatrix {
    size: usize,
    row_ptr: Vec<usize>,
    cols: Vec<usize>,
    values: Vec<f64>,
}

impl CsrMatrix {
    /// Build a `size x size` matrix, summing triplets at the same position.
    pub fn from_triplets(size: usize, triplets: &[Triplet]) -> Self {
        let mut sorted: Vec<Triplet> = triplets.to_vec();
        sorted.sort_unstable_by_key(|t| (t.row, t.col));

        let mut row_ptr = vec![0; size + 1];
        let mut cols: Vec<usize> = Vec::with_capacity(sorted.len());
        let mut values: Vec<f64> = Vec::with_capacity(sorted.len());
        let mut last: Option<(usize, usize)> = None;
        for t in sorted {
            if last == Some((t.row, t.col)) {
                if let Some(v) = values.last_mut() {
                    *v += t.value;
                }
                continue;
            }
            last = Some((t.row, t.col));
            row_ptr[t.row + 1] += 1;
            cols.push(t.col);
            values.push(t.value);
        }
        for i in 0..size {
            row_ptr[i + 1] += row_ptr[i];
        }

        Self {
            size,
            row_ptr,
            cols,
            values,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of stored entries.
    #[inline]
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Column indices and values of one row.
    pub fn row(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.row_ptr[i]..self.row_ptr[i + 1];
        self.cols[range.clone()]
            .iter()
            .copied()
            .zip(self.values[range].iter().copied())
    }

    /// `y = A x`
    pub fn spmv(&self, x: &[f64], y: &mut [f64]) {
        let row_dot = |i: usize| self.row(i).map(|(j, v)| v * x[j]).sum::<f64>();
        #[cfg(feature = "parallel")]
        {
            y.par_iter_mut()
                .enumerate()
                .for_each(|(i, yi)| *yi = row_dot(i));
        }
        #[cfg(not(feature = "parallel"))]
        {
            for (i, yi) in y.iter_mut().enumerate() {
                *yi = row_dot(i);
            }
        }
    }

    pub fn diagonal(&self) -> Vec<f64> {
        (0..self.size)
            .map(|i| {
                self.row(i)
                    .find(|(j, _)| *j == i)
                    .map_or(0.0, |(_, v)| v)
            })
            .collect()
    }

    /// Dense copy, row-major.
    pub fn to_dense(&self) -> Vec<Vec<f64>> {
        let mut dense = vec![vec![0.0; self.size]; self.size];
        for (i, row) in dense.iter_mut().enumerate() {
            for (j, v) in self.row(i) {
                row[j] = v;
            }
        }
        dense
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Vec3;

    /// Writes land at global positions, and duplicates are summed.
    #[test]
    fn assemble_csr() {
        let mut buf = vec![Triplet::default(); 12];
        let mut view = TripletView::new("Test", &mut buf[..3], (1, 2), (3, 1));
        view.push(0, 0, 1.0).unwrap();
        view.push(1, 0, 2.0).unwrap();
        view.push(1, 0, 0.5).unwrap();
        assert!(matches!(
            view.push(0, 0, 1.0),
            Err(AssemblyError::SegmentOverflow { capacity: 3, .. })
        ));

        let mut view = TripletView::new("Test", &mut buf[3..], (0, 3), (0, 3));
        assert!(matches!(
            view.push(3, 0, 1.0),
            Err(AssemblyError::OutOfBlock { row: 3, .. })
        ));
        let block = m::outer(Vec3::new(1.0, 0.0, 0.0), Vec3::new(1.0, 2.0, 3.0));
        view.push_block3(0, 0, &block).unwrap();
        assert_eq!(view.written(), 9);

        let a = CsrMatrix::from_triplets(4, &buf);
        let dense = a.to_dense();
        assert_eq!(dense[0], vec![1.0, 2.0, 3.0, 0.0]);
        assert_eq!(dense[1], vec![0.0, 0.0, 0.0, 1.0]);
        assert_eq!(dense[2], vec![0.0, 0.0, 0.0, 2.5]);
        assert_eq!(dense[3], vec![0.0; 4]);
        assert_eq!(a.diagonal(), vec![1.0, 0.0, 0.0, 0.0]);

        let mut y = vec![0.0; 4];
        a.spmv(&[1.0, 1.0, 1.0, 2.0], &mut y);
        assert_eq!(y, vec![6.0, 2.0, 5.0, 0.0]);
    }
}
