use crate::error::{CtcError, Result};

const NEG_INF: f32 = f32::NEG_INFINITY;

/// `log(exp(a) + exp(b))` without leaving the log domain.
pub(crate) fn log_add(a: f32, b: f32) -> f32 {
    if a == NEG_INF {
        return b;
    }
    if b == NEG_INF {
        return a;
    }
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// Number of `f32` slots one sequence needs: log-probabilities (reused for the
/// gradient), alphas, betas and a per-class accumulator.
pub(crate) fn sequence_slots(time: usize, label_length: usize, alphabet_size: usize) -> Option<usize> {
    let states = label_length.checked_mul(2)?.checked_add(1)?;
    let probs = time.checked_mul(alphabet_size)?;
    let lattice = states.checked_mul(time)?.checked_mul(2)?;
    probs.checked_add(lattice)?.checked_add(alphabet_size)
}

/// Time-major activations of a whole minibatch.
pub(crate) struct Activations<'a> {
    pub data: &'a [f32],
    pub minibatch: usize,
    pub alphabet_size: usize,
}

impl Activations<'_> {
    fn row(&self, time: usize, batch: usize) -> &[f32] {
        let start = (time * self.minibatch + batch) * self.alphabet_size;
        &self.data[start..start + self.alphabet_size]
    }
}

/// One sequence of the minibatch.
pub(crate) struct Sequence<'a> {
    pub batch: usize,
    pub labels: &'a [usize],
    pub time: usize,
}

/// Blank-extended label lattice `blank, l1, blank, ..., lL, blank`.
struct Lattice<'a> {
    labels: &'a [usize],
    blank: usize,
    merge_repeated: bool,
}

impl Lattice<'_> {
    fn states(&self) -> usize {
        2 * self.labels.len() + 1
    }

    fn prime(&self, s: usize) -> usize {
        if s % 2 == 0 {
            self.blank
        } else {
            self.labels[s / 2]
        }
    }

    fn self_loop(&self, s: usize) -> bool {
        self.merge_repeated || self.prime(s) == self.blank
    }

    /// Whether the lattice may jump from state `from` straight to `from + 2`.
    fn skip(&self, from: usize) -> bool {
        let to = self.prime(from + 2);
        to != self.blank && !(self.merge_repeated && to == self.prime(from))
    }
}

/// Log-likelihood and (optionally) gradient of one sequence.
///
/// The gradient is left in the first `time * alphabet_size` slots of `workspace`,
/// row `t` at `t * alphabet_size`.
pub(crate) fn compute_sequence(
    activations: &Activations,
    sequence: &Sequence,
    blank: usize,
    merge_repeated: bool,
    workspace: &mut [f32],
    with_gradient: bool,
) -> Result<f32> {
    let alphabet_size = activations.alphabet_size;
    let time = sequence.time;
    let batch = sequence.batch;
    let lattice = Lattice {
        labels: sequence.labels,
        blank,
        merge_repeated,
    };
    let states = lattice.states();

    if time == 0 {
        // only an empty label sequence is feasible; the empty alignment has probability 1
        return Ok(0.0);
    }

    let (probs, rest) = workspace.split_at_mut(time * alphabet_size);
    let (alphas, rest) = rest.split_at_mut(states * time);
    let (betas, rest) = rest.split_at_mut(states * time);
    let class_acc = &mut rest[..alphabet_size];

    for t in 0..time {
        let row = activations.row(t, batch);
        let out = &mut probs[t * alphabet_size..(t + 1) * alphabet_size];
        let max = row.iter().copied().fold(NEG_INF, f32::max);
        let sum: f32 = row.iter().map(|&x| (x - max).exp()).sum();
        let normalizer = max + sum.ln();
        if !normalizer.is_finite() {
            return Err(CtcError::Computation {
                batch,
                reason: format!("non-finite activations at time step {t}"),
            });
        }
        for (o, &x) in out.iter_mut().zip(row) {
            *o = x - normalizer;
        }
    }
    let log_prob = |t: usize, class: usize| probs[t * alphabet_size + class];

    // forward variables
    alphas.fill(NEG_INF);
    alphas[0] = log_prob(0, blank);
    if states > 1 {
        alphas[1] = log_prob(0, lattice.prime(1));
    }
    for t in 1..time {
        let (prev, cur) = alphas.split_at_mut(t * states);
        let prev = &prev[(t - 1) * states..];
        let cur = &mut cur[..states];
        for s in 0..states {
            let mut sum = if lattice.self_loop(s) { prev[s] } else { NEG_INF };
            if s > 0 {
                sum = log_add(sum, prev[s - 1]);
            }
            if s > 1 && lattice.skip(s - 2) {
                sum = log_add(sum, prev[s - 2]);
            }
            if sum != NEG_INF {
                cur[s] = sum + log_prob(t, lattice.prime(s));
            }
        }
    }

    let last = &alphas[(time - 1) * states..time * states];
    let log_likelihood = if states > 1 {
        log_add(last[states - 1], last[states - 2])
    } else {
        last[0]
    };
    if !log_likelihood.is_finite() {
        return Err(CtcError::Computation {
            batch,
            reason: "no valid alignment between labels and activations".to_string(),
        });
    }

    if !with_gradient {
        return Ok(-log_likelihood);
    }

    // backward variables
    betas.fill(NEG_INF);
    let tail = (time - 1) * states;
    betas[tail + states - 1] = log_prob(time - 1, blank);
    if states > 1 {
        betas[tail + states - 2] = log_prob(time - 1, lattice.prime(states - 2));
    }
    for t in (0..time - 1).rev() {
        let (cur, next) = betas.split_at_mut((t + 1) * states);
        let cur = &mut cur[t * states..];
        let next = &next[..states];
        for s in 0..states {
            let mut sum = if lattice.self_loop(s) { next[s] } else { NEG_INF };
            if s + 1 < states {
                sum = log_add(sum, next[s + 1]);
            }
            if s + 2 < states && lattice.skip(s) {
                sum = log_add(sum, next[s + 2]);
            }
            if sum != NEG_INF {
                cur[s] = sum + log_prob(t, lattice.prime(s));
            }
        }
    }

    for t in 0..time {
        class_acc.fill(NEG_INF);
        for s in 0..states {
            let idx = t * states + s;
            let class = lattice.prime(s);
            class_acc[class] = log_add(class_acc[class], alphas[idx] + betas[idx]);
        }

        let row = &mut probs[t * alphabet_size..(t + 1) * alphabet_size];
        for (class, slot) in row.iter_mut().enumerate() {
            let lp = *slot;
            // classes no alignment passes through keep the bare softmax, which also
            // covers masked classes whose log-probability is -inf
            let occupancy = class_acc[class];
            let grad = if occupancy == NEG_INF {
                lp.exp()
            } else {
                lp.exp() - (occupancy - lp - log_likelihood).exp()
            };
            if !grad.is_finite() {
                return Err(CtcError::Computation {
                    batch,
                    reason: format!("non-finite gradient at time step {t}, class {class}"),
                });
            }
            *slot = grad;
        }
    }

    Ok(-log_likelihood)
}

#[cfg(test)]
mod test {
    use super::*;

    fn run(
        data: &[f32],
        alphabet_size: usize,
        labels: &[usize],
        merge_repeated: bool,
    ) -> (f32, Vec<f32>) {
        let time = data.len() / alphabet_size;
        let activations = Activations {
            data,
            minibatch: 1,
            alphabet_size,
        };
        let sequence = Sequence {
            batch: 0,
            labels,
            time,
        };
        let slots = sequence_slots(time, labels.len(), alphabet_size).unwrap();
        let mut workspace = vec![0.0; slots];
        let loss = compute_sequence(
            &activations,
            &sequence,
            0,
            merge_repeated,
            &mut workspace,
            true,
        )
        .unwrap();

        (loss, workspace[..time * alphabet_size].to_vec())
    }

    #[test]
    fn test_log_add() {
        assert_eq!(log_add(NEG_INF, 1.5), 1.5);
        assert_eq!(log_add(-2.0, NEG_INF), -2.0);
        let expected = (0.25f32.exp() + 0.75f32.exp()).ln();
        assert!((log_add(0.25, 0.75) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_uniform_single_label() {
        // paths "11", "_1", "1_" each with probability 1/9
        let (loss, grad) = run(&[0.0; 6], 3, &[1], true);
        assert!((loss - 3f32.ln()).abs() < 1e-5);
        // every row of the gradient sums to zero
        for row in grad.chunks(3) {
            assert!(row.iter().sum::<f32>().abs() < 1e-5);
        }

        // without merging "11" would mean two labels
        let (loss, _) = run(&[0.0; 6], 3, &[1], false);
        assert!((loss - 4.5f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_empty_labels() {
        let data = [2.0, 0.0, 0.0, 1.0, 0.5, -1.0];
        let (loss, _) = run(&data, 3, &[], true);
        let blank_0 = 2.0 - (2f32.exp() + 2.0).ln();
        let blank_1 = 1.0 - (1f32.exp() + 0.5f32.exp() + (-1f32).exp()).ln();
        assert!((loss + blank_0 + blank_1).abs() < 1e-5);
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let data: Vec<f32> = (0..20).map(|i| ((i * 7 % 11) as f32 - 5.0) / 4.0).collect();
        let labels = [1, 2, 2];
        let (_, grad) = run(&data, 4, &labels, true);

        let eps = 1e-2;
        for idx in 0..data.len() {
            let mut plus = data.clone();
            plus[idx] += eps;
            let mut minus = data.clone();
            minus[idx] -= eps;
            let numeric = (run(&plus, 4, &labels, true).0 - run(&minus, 4, &labels, true).0)
                / (2.0 * eps);
            assert!(
                (numeric - grad[idx]).abs() < 1e-2,
                "index {idx}: analytic {} vs numeric {numeric}",
                grad[idx]
            );
        }
    }

    #[test]
    fn test_masked_class() {
        let masked = f32::NEG_INFINITY;
        let data = [0.0, 0.0, masked, 0.0, 0.0, masked];
        let (loss, grad) = run(&data, 3, &[1], true);

        // "11", "_1", "1_" out of four paths over two classes
        assert!((loss - (4.0f32 / 3.0).ln()).abs() < 1e-5);
        for row in grad.chunks(3) {
            assert!(row.iter().all(|g| g.is_finite()));
            assert_eq!(row[2], 0.0);
            assert!((row[0] - 1.0 / 6.0).abs() < 1e-5);
            assert!((row[1] + 1.0 / 6.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_non_finite_activation() {
        let data = [0.0, f32::NAN, 0.0];
        let activations = Activations {
            data: &data,
            minibatch: 1,
            alphabet_size: 3,
        };
        let sequence = Sequence {
            batch: 0,
            labels: &[1],
            time: 1,
        };
        let mut workspace = vec![0.0; sequence_slots(1, 1, 3).unwrap()];
        let err =
            compute_sequence(&activations, &sequence, 0, true, &mut workspace, true).unwrap_err();
        assert!(matches!(err, CtcError::Computation { batch: 0, .. }));
    }
}
