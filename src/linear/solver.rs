//! Preconditioned conjugate gradient.

use crate::system::SystemError;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// What the solver needs from the system it solves.
pub trait PcgOps {
    /// `y = A x`
    fn spmv(&mut self, x: &[f64], y: &mut [f64]);
    /// `z = M^-1 r`
    fn precondition(&mut self, r: &[f64], z: &mut [f64]) -> Result<(), SystemError>;
    /// Extra convergence condition on the residual, checked once the tolerance is met.
    fn accurate(&mut self, _r: &[f64]) -> Result<bool, SystemError> {
        Ok(true)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolveReport {
    pub iterations: usize,
    pub converged: bool,
    /// Norm of the final residual.
    pub residual: f64,
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    #[cfg(feature = "parallel")]
    let ret = a.par_iter().zip(b.par_iter()).map(|(x, y)| x * y).sum();
    #[cfg(not(feature = "parallel"))]
    let ret = a.iter().zip(b).map(|(x, y)| x * y).sum();
    ret
}

/// `y += s * x`
fn axpy(s: f64, x: &[f64], y: &mut [f64]) {
    #[cfg(feature = "parallel")]
    {
        y.par_iter_mut().zip(x.par_iter()).for_each(|(y, x)| *y += s * x);
    }
    #[cfg(not(feature = "parallel"))]
    {
        for (y, x) in y.iter_mut().zip(x) {
            *y += s * x;
        }
    }
}

/// Solve `A x = b` starting from `x = 0`.
///
/// Stops when `sqrt(r . z)` falls below `tol_rate` times its initial value
/// and [`PcgOps::accurate`] agrees, or after `max_iter` iterations.
pub fn pcg(
    ops: &mut impl PcgOps,
    b: &[f64],
    x: &mut [f64],
    max_iter: usize,
    tol_rate: f64,
) -> Result<SolveReport, SystemError> {
    let _span = tracy_span!("pcg", "pcg");
    let n = b.len();
    x.fill(0.0);
    let mut r = b.to_vec();
    let mut z = vec![0.0; n];
    let mut ap = vec![0.0; n];

    ops.precondition(&r, &mut z)?;
    let mut p = z.clone();
    let mut rz = dot(&r, &z);
    let rz0 = rz.abs();
    let report = |iterations, converged, r: &[f64]| SolveReport {
        iterations,
        converged,
        residual: dot(r, r).sqrt(),
    };

    if rz0 == 0.0 {
        return Ok(report(0, true, &r));
    }
    let threshold = tol_rate * tol_rate * rz0;

    for iter in 1..=max_iter {
        ops.spmv(&p, &mut ap);
        let pap = dot(&p, &ap);
        if pap <= 0.0 {
            log::warn!("Linear system is not positive definite (pAp = {}), stopping PCG", pap);
            return Ok(report(iter, false, &r));
        }
        let alpha = rz / pap;
        axpy(alpha, &p, x);
        axpy(-alpha, &ap, &mut r);

        ops.precondition(&r, &mut z)?;
        let rz_new = dot(&r, &z);
        if rz_new.abs() <= threshold && ops.accurate(&r)? {
            return Ok(report(iter, true, &r));
        }

        let beta = rz_new / rz;
        rz = rz_new;
        for (p, z) in p.iter_mut().zip(&z) {
            *p = z + beta * *p;
        }
    }
    Ok(report(max_iter, false, &r))
}
