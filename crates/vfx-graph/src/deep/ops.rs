//! Sample list utilities: combine overlapping samples, tidy, composite.
//!
//! Volumetric samples are split assuming uniform density along their
//! depth range: a fraction `t` of a sample with alpha `a` has alpha
//! `1 - (1 - a)^t` and its colour scales by the same ratio.

use smallvec::SmallVec;

use super::plane::DeepSample;

/// How coincident samples are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CombineMode {
    /// Interpenetrating volumes: optical depths add.
    #[default]
    Merge,
    /// Plain sum, alpha clamped to 1.
    Add,
}

/// Flat result of compositing one pixel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Composite {
    /// Premultiplied colour channels.
    pub color: SmallVec<[f32; 4]>,
    /// Accumulated coverage.
    pub alpha: f32,
    /// Front depth of the first sample with non-zero alpha.
    pub z: Option<f32>,
    /// Smallest front depth of any sample.
    pub front_z: Option<f32>,
}

fn split(s: &DeepSample, z0: f32, z1: f32) -> DeepSample {
    let thickness = s.back - s.front;
    if thickness <= 0.0 || (z0 <= s.front && z1 >= s.back) {
        return DeepSample {
            front: z0,
            back: z1,
            ..s.clone()
        };
    }
    let t = ((z1 - z0) / thickness).clamp(0.0, 1.0);
    let (alpha, scale) = if s.alpha >= 1.0 {
        (1.0, 1.0)
    } else if s.alpha <= 0.0 {
        (0.0, t)
    } else {
        let a = -f32::exp_m1(f32::ln_1p(-s.alpha) * t);
        (a, a / s.alpha)
    };
    DeepSample {
        front: z0,
        back: z1,
        alpha,
        color: s.color.iter().map(|c| c * scale).collect(),
    }
}

fn merge(parts: &[DeepSample], mode: CombineMode, z0: f32, z1: f32) -> DeepSample {
    if parts.len() == 1 {
        return parts[0].clone();
    }
    let n = parts.iter().map(|p| p.color.len()).max().unwrap_or(0);
    let mut color: SmallVec<[f32; 4]> = SmallVec::from_elem(0.0, n);
    match mode {
        CombineMode::Add => {
            let mut alpha = 0.0;
            for p in parts {
                alpha += p.alpha;
                for (o, c) in color.iter_mut().zip(&p.color) {
                    *o += c;
                }
            }
            DeepSample {
                front: z0,
                back: z1,
                alpha: alpha.min(1.0),
                color,
            }
        }
        CombineMode::Merge => {
            let opaque: Vec<&DeepSample> = parts.iter().filter(|p| p.alpha >= 1.0).collect();
            if !opaque.is_empty() {
                let k = opaque.len() as f32;
                for p in &opaque {
                    for (o, c) in color.iter_mut().zip(&p.color) {
                        *o += c / k;
                    }
                }
                return DeepSample {
                    front: z0,
                    back: z1,
                    alpha: 1.0,
                    color,
                };
            }
            let mut u_sum = 0.0f32;
            for p in parts {
                let u = -f32::ln_1p(-p.alpha.max(0.0));
                let v = if p.alpha > 0.0 { u / p.alpha } else { 1.0 };
                u_sum += u;
                for (o, c) in color.iter_mut().zip(&p.color) {
                    *o += c * v;
                }
            }
            let alpha = -f32::exp_m1(-u_sum);
            let w = if u_sum > 0.0 { alpha / u_sum } else { 1.0 };
            for o in color.iter_mut() {
                *o *= w;
            }
            DeepSample {
                front: z0,
                back: z1,
                alpha,
                color,
            }
        }
    }
}

/// Splits samples at every depth boundary and merges what coincides, so
/// the result has no two overlapping samples.
///
/// The result is sorted by depth and ends at the first opaque sample.
pub fn combine_overlapping(samples: &[DeepSample], mode: CombineMode) -> Vec<DeepSample> {
    let mut bounds: Vec<f32> = samples
        .iter()
        .flat_map(|s| [s.front, s.back])
        .filter(|z| z.is_finite())
        .collect();
    bounds.sort_by(f32::total_cmp);
    bounds.dedup();

    let mut out = Vec::new();
    for (i, &z) in bounds.iter().enumerate() {
        let points: Vec<DeepSample> = samples
            .iter()
            .filter(|s| s.is_point() && s.front == z)
            .cloned()
            .collect();
        if !points.is_empty() {
            let m = merge(&points, mode, z, z);
            let opaque = m.alpha >= 1.0;
            out.push(m);
            if opaque {
                return out;
            }
        }
        let Some(&z1) = bounds.get(i + 1) else { break };
        let parts: Vec<DeepSample> = samples
            .iter()
            .filter(|s| !s.is_point() && s.front <= z && s.back >= z1)
            .map(|s| split(s, z, z1))
            .collect();
        if parts.is_empty() {
            continue;
        }
        let m = merge(&parts, mode, z, z1);
        let opaque = m.alpha >= 1.0;
        out.push(m);
        if opaque {
            break;
        }
    }
    out
}

/// Canonical form: sorted, non-overlapping, coincident samples merged,
/// fully transparent empty samples dropped.
pub fn tidy(samples: &[DeepSample], mode: CombineMode) -> Vec<DeepSample> {
    let kept: Vec<DeepSample> = samples
        .iter()
        .filter(|s| s.alpha > 0.0 || s.color.iter().any(|c| *c != 0.0))
        .cloned()
        .collect();
    combine_overlapping(&kept, mode)
}

/// Front-to-back premultiplied over of a pixel's samples.
///
/// Samples are sorted by front depth first; input order does not matter.
pub fn composite(samples: &[DeepSample]) -> Composite {
    let mut order: Vec<&DeepSample> = samples.iter().collect();
    order.sort_by(|a, b| a.front.total_cmp(&b.front).then(a.back.total_cmp(&b.back)));

    let n = samples.iter().map(|s| s.color.len()).max().unwrap_or(0);
    let mut out = Composite {
        color: SmallVec::from_elem(0.0, n),
        ..Default::default()
    };
    for s in order {
        out.front_z = Some(out.front_z.map_or(s.front, |f: f32| f.min(s.front)));
        if out.alpha >= 1.0 {
            continue;
        }
        let t = 1.0 - out.alpha;
        for (o, c) in out.color.iter_mut().zip(&s.color) {
            *o += t * c;
        }
        out.alpha += t * s.alpha;
        if out.z.is_none() && s.alpha > 0.0 {
            out.z = Some(s.front);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_composite_two_halves() {
        let a = DeepSample::point(1.0, 0.5, &[0.5]);
        let b = DeepSample::point(2.0, 0.5, &[0.5]);
        let c = composite(&[b.clone(), a.clone()]);
        assert_relative_eq!(c.color[0], 0.75);
        assert_relative_eq!(c.alpha, 0.75);
        assert_eq!(c.z, Some(1.0));
        assert_eq!(c.front_z, Some(1.0));
    }

    #[test]
    fn test_split_preserves_total_alpha() {
        let s = DeepSample::new(0.0, 2.0, 0.75, &[0.75]);
        let combined = combine_overlapping(&[s, DeepSample::new(1.0, 3.0, 0.0, &[0.0])], CombineMode::Merge);
        assert_eq!(combined.len(), 3);
        let flat = composite(&combined);
        assert_relative_eq!(flat.alpha, 0.75, epsilon = 1e-5);
        assert_relative_eq!(flat.color[0], 0.75, epsilon = 1e-5);
    }

    #[test]
    fn test_merge_coincident() {
        let a = DeepSample::new(0.0, 1.0, 0.5, &[0.5]);
        let b = DeepSample::new(0.0, 1.0, 0.5, &[0.25]);
        let m = combine_overlapping(&[a, b], CombineMode::Merge);
        assert_eq!(m.len(), 1);
        assert_relative_eq!(m[0].alpha, 0.75, epsilon = 1e-6);
        // equal optical depths weigh both colours the same
        assert_relative_eq!(m[0].color[0], (0.5 + 0.25) * 0.75, epsilon = 1e-5);
    }

    #[test]
    fn test_add_mode_clamps_alpha() {
        let a = DeepSample::point(1.0, 0.75, &[0.5]);
        let b = DeepSample::point(1.0, 0.75, &[0.5]);
        let m = combine_overlapping(&[a, b], CombineMode::Add);
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].alpha, 1.0);
        assert_eq!(m[0].color[0], 1.0);
    }

    #[test]
    fn test_stops_at_opaque_prefix() {
        let samples = [
            DeepSample::point(1.0, 1.0, &[0.2]),
            DeepSample::point(2.0, 0.5, &[0.5]),
        ];
        let m = combine_overlapping(&samples, CombineMode::Merge);
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].front, 1.0);
    }

    #[test]
    fn test_tidy_keeps_composite_of_disjoint_samples() {
        let samples = [
            DeepSample::new(3.0, 4.0, 0.3, &[0.1]),
            DeepSample::new(0.0, 1.0, 0.5, &[0.4]),
            DeepSample::point(2.0, 0.25, &[0.2]),
        ];
        let before = composite(&samples);
        let after = composite(&tidy(&samples, CombineMode::Merge));
        assert_relative_eq!(before.alpha, after.alpha, epsilon = 1e-6);
        assert_relative_eq!(before.color[0], after.color[0], epsilon = 1e-6);
        assert_eq!(before.z, after.z);
    }
}
