//! Quadratic penalty contact: `E = kappa / 2 * (d_hat - d)^2` for every pair
//! closer than `d_hat`, where `d` is the gap between the surfaces.

use super::{
    ContactAssembleInfo, ContactEnergyInfo, ContactExtentInfo, ContactGradient, ContactHessian,
    ContactReporter, GlobalContactManager,
};
use crate::{
    collision::{VertexHalfPlaneFilter, VertexVertexFilter},
    geometry::{GlobalVertexManager, HalfPlaneSystem},
    math::{self as m, Mat3, Vec3},
    scene::HalfPlane,
    system::{
        resolved, BuildContext, BuildError, Capability, Subsystem, SystemCollection, SystemError,
        SystemSlot,
    },
};

/// Energy, gradient and Hessian of the penalty along a contact normal.
#[derive(Clone, Copy, Debug)]
struct Penalty {
    energy: f64,
    /// Gradient with respect to moving along the normal.
    gradient: Vec3,
    hessian: Mat3,
}

fn penalty(gap: f64, normal: Vec3, params: &ContactEnergyInfo) -> Option<Penalty> {
    if gap >= params.d_hat {
        return None;
    }
    let depth = params.d_hat - gap;
    Some(Penalty {
        energy: 0.5 * params.kappa * depth * depth,
        gradient: normal * (-params.kappa * depth),
        hessian: m::scaled(&m::outer(normal, normal), params.kappa),
    })
}

fn half_plane_penalty(
    plane: &HalfPlane,
    x: Vec3,
    thickness: f64,
    params: &ContactEnergyInfo,
) -> Option<Penalty> {
    penalty(plane.signed_distance(x) - thickness, plane.normal, params)
}

/// Penalty for the pair, with the gradient taken with respect to `xi`.
/// The gradient for `xj` is the negation.
fn vertex_pair_penalty(
    xi: Vec3,
    xj: Vec3,
    radius: f64,
    params: &ContactEnergyInfo,
) -> Option<Penalty> {
    let diff = xi - xj;
    let dist = diff.mag();
    if dist <= f64::EPSILON {
        // no usable normal
        return None;
    }
    penalty(dist - radius, diff / dist, params)
}

//
// Vertex / half-plane
//

/// Penalty contact between vertices and half-planes.
#[derive(Default)]
pub struct VertexHalfPlanePenalty {
    vertices: Option<SystemSlot<GlobalVertexManager>>,
    planes: Option<SystemSlot<HalfPlaneSystem>>,
    filter: Option<SystemSlot<VertexHalfPlaneFilter>>,
    d_hat: f64,
    /// Penalized vertices found when reporting the extent.
    contacts: Vec<(u32, Penalty)>,
}

impl Subsystem for VertexHalfPlanePenalty {
    fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
        let manager = ctx.require::<GlobalContactManager>()?;
        self.vertices = Some(ctx.require::<GlobalVertexManager>()?);
        self.planes = Some(ctx.require::<HalfPlaneSystem>()?);
        self.filter = Some(ctx.require::<VertexHalfPlaneFilter>()?);
        self.d_hat = ctx.config().contact.d_hat;
        let this = Capability::<dyn ContactReporter>::of(ctx.this::<Self>());
        ctx.on_built(move |systems| {
            systems.get_mut(manager)?.add_reporter(this)?;
            Ok(())
        });
        Ok(())
    }
}

impl ContactReporter for VertexHalfPlanePenalty {
    fn d_hat(&self) -> f64 {
        self.d_hat
    }

    fn report_extent(
        &mut self,
        systems: &SystemCollection,
        info: &mut ContactExtentInfo,
    ) -> Result<(), SystemError> {
        let vm = systems.get(resolved(self.vertices)?)?;
        let planes = systems.get(resolved(self.planes)?)?.planes();
        let active = systems.get(resolved(self.filter)?)?.active_pairs();
        let params = info.params();

        self.contacts.clear();
        self.contacts.extend(active.iter().filter_map(|&(i, j)| {
            let v = i as usize;
            half_plane_penalty(&planes[j as usize], vm.positions()[v], vm.thicknesses()[v], &params)
                .map(|p| (i, p))
        }));
        info.gradient_count(self.contacts.len());
        info.hessian_count(self.contacts.len());
        Ok(())
    }

    fn assemble(
        &mut self,
        _systems: &SystemCollection,
        info: &mut ContactAssembleInfo<'_>,
    ) -> Result<(), SystemError> {
        for (slot, &(i, p)) in info.gradients().iter_mut().zip(&self.contacts) {
            *slot = ContactGradient {
                vertex: i,
                gradient: p.gradient,
            };
        }
        for (slot, &(i, p)) in info.hessians().iter_mut().zip(&self.contacts) {
            *slot = ContactHessian {
                i,
                j: i,
                block: p.hessian,
            };
        }
        Ok(())
    }

    fn compute_energy(
        &mut self,
        systems: &SystemCollection,
        info: &ContactEnergyInfo,
    ) -> Result<f64, SystemError> {
        let vm = systems.get(resolved(self.vertices)?)?;
        let planes = systems.get(resolved(self.planes)?)?.planes();
        let filter = systems.get(resolved(self.filter)?)?;
        Ok(filter
            .candidates()
            .filter_map(|(i, j)| {
                let v = i as usize;
                half_plane_penalty(&planes[j as usize], vm.positions()[v], vm.thicknesses()[v], info)
            })
            .map(|p| p.energy)
            .sum())
    }
}

//
// Vertex / vertex
//

/// Penalty contact between vertices of different bodies.
#[derive(Default)]
pub struct VertexVertexPenalty {
    vertices: Option<SystemSlot<GlobalVertexManager>>,
    filter: Option<SystemSlot<VertexVertexFilter>>,
    d_hat: f64,
    /// Penalized pairs found when reporting the extent.
    contacts: Vec<(u32, u32, Penalty)>,
}

impl Subsystem for VertexVertexPenalty {
    fn build(&mut self, ctx: &mut BuildContext<'_>) -> Result<(), BuildError> {
        let manager = ctx.require::<GlobalContactManager>()?;
        self.vertices = Some(ctx.require::<GlobalVertexManager>()?);
        self.filter = Some(ctx.require::<VertexVertexFilter>()?);
        self.d_hat = ctx.config().contact.d_hat;
        let this = Capability::<dyn ContactReporter>::of(ctx.this::<Self>());
        ctx.on_built(move |systems| {
            systems.get_mut(manager)?.add_reporter(this)?;
            Ok(())
        });
        Ok(())
    }
}

impl ContactReporter for VertexVertexPenalty {
    fn d_hat(&self) -> f64 {
        self.d_hat
    }

    fn report_extent(
        &mut self,
        systems: &SystemCollection,
        info: &mut ContactExtentInfo,
    ) -> Result<(), SystemError> {
        let vm = systems.get(resolved(self.vertices)?)?;
        let active = systems.get(resolved(self.filter)?)?.active_pairs();
        let (xs, thicknesses) = (vm.positions(), vm.thicknesses());
        let params = info.params();

        self.contacts.clear();
        self.contacts.extend(active.iter().filter_map(|&(i, j)| {
            let (vi, vj) = (i as usize, j as usize);
            vertex_pair_penalty(xs[vi], xs[vj], thicknesses[vi] + thicknesses[vj], &params)
                .map(|p| (i, j, p))
        }));
        info.gradient_count(2 * self.contacts.len());
        info.hessian_count(4 * self.contacts.len());
        Ok(())
    }

    fn assemble(
        &mut self,
        _systems: &SystemCollection,
        info: &mut ContactAssembleInfo<'_>,
    ) -> Result<(), SystemError> {
        for (k, &(i, j, p)) in self.contacts.iter().enumerate() {
            let gradients = &mut info.gradients()[2 * k..2 * k + 2];
            gradients[0] = ContactGradient {
                vertex: i,
                gradient: p.gradient,
            };
            gradients[1] = ContactGradient {
                vertex: j,
                gradient: -p.gradient,
            };

            let coupling = m::scaled(&p.hessian, -1.0);
            let hessians = &mut info.hessians()[4 * k..4 * k + 4];
            hessians[0] = ContactHessian { i, j: i, block: p.hessian };
            hessians[1] = ContactHessian { i: j, j, block: p.hessian };
            hessians[2] = ContactHessian { i, j, block: coupling };
            hessians[3] = ContactHessian { i: j, j: i, block: coupling };
        }
        Ok(())
    }

    fn compute_energy(
        &mut self,
        systems: &SystemCollection,
        info: &ContactEnergyInfo,
    ) -> Result<f64, SystemError> {
        let vm = systems.get(resolved(self.vertices)?)?;
        let filter = systems.get(resolved(self.filter)?)?;
        let (xs, thicknesses) = (vm.positions(), vm.thicknesses());
        Ok(filter
            .candidates()
            .filter_map(|(i, j)| {
                let (vi, vj) = (i as usize, j as usize);
                vertex_pair_penalty(xs[vi], xs[vj], thicknesses[vi] + thicknesses[vj], info)
            })
            .map(|p| p.energy)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    const PARAMS: ContactEnergyInfo = ContactEnergyInfo {
        d_hat: 0.1,
        kappa: 100.0,
    };

    fn energy_or_zero(p: Option<Penalty>) -> f64 {
        p.map_or(0.0, |p| p.energy)
    }

    /// The reported gradients match central differences of the energy.
    #[test]
    fn gradients_match_finite_differences() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let plane = HalfPlane::new(Vec3::zero(), Vec3::new(0.3, 1.0, -0.2));
        let h = 1e-6;
        let axes = [Vec3::unit_x(), Vec3::unit_y(), Vec3::unit_z()];

        for _ in 0..20 {
            let x = Vec3::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(0.0..0.08),
                rng.gen_range(-1.0..1.0),
            );
            let p = match half_plane_penalty(&plane, x, 0.01, &PARAMS) {
                Some(p) => p,
                None => continue,
            };
            for (axis, e) in axes.iter().enumerate() {
                let fd = (energy_or_zero(half_plane_penalty(&plane, x + *e * h, 0.01, &PARAMS))
                    - energy_or_zero(half_plane_penalty(&plane, x - *e * h, 0.01, &PARAMS)))
                    / (2.0 * h);
                assert!((fd - m::component(p.gradient, axis)).abs() < 1e-4);
            }

            let xj = x + Vec3::new(0.05, rng.gen_range(-0.02..0.02), 0.0);
            let p = match vertex_pair_penalty(x, xj, 0.02, &PARAMS) {
                Some(p) => p,
                None => continue,
            };
            for (axis, e) in axes.iter().enumerate() {
                let fd = (energy_or_zero(vertex_pair_penalty(x + *e * h, xj, 0.02, &PARAMS))
                    - energy_or_zero(vertex_pair_penalty(x - *e * h, xj, 0.02, &PARAMS)))
                    / (2.0 * h);
                assert!((fd - m::component(p.gradient, axis)).abs() < 1e-4);
            }
        }
    }

    /// Nothing beyond the activation distance.
    #[test]
    fn inactive_beyond_d_hat() {
        let plane = HalfPlane::new(Vec3::zero(), Vec3::unit_y());
        assert!(half_plane_penalty(&plane, Vec3::new(0.0, 0.2, 0.0), 0.0, &PARAMS).is_none());
        assert!(half_plane_penalty(&plane, Vec3::new(0.0, 0.2, 0.0), 0.15, &PARAMS).is_some());
        assert!(vertex_pair_penalty(Vec3::zero(), Vec3::unit_x(), 0.5, &PARAMS).is_none());
        assert!(vertex_pair_penalty(Vec3::zero(), Vec3::zero(), 0.5, &PARAMS).is_none());
    }
}
