// Token sampling for chat generation.
//
// A `Sampler` is built fresh for every turn from `SamplingParams`. It
// supports greedy (argmax) and stochastic sampling with repetition
// penalties, temperature, top-k, top-p (nucleus) and min-p filtering.
// Randomness comes from a small XorShift RNG.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::SamplingParams;
use crate::error::InferenceError;

/// Simple XorShift64 RNG.
pub struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    /// Create a new RNG from a seed. Seed of 0 is adjusted to 1.
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Seed from the wall clock.
    pub fn from_entropy() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x2545_f491_4f6c_dd1d);
        Self::new(nanos ^ 0x9e37_79b9_7f4a_7c15)
    }

    /// Generate the next u64 value.
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Generate a random f32 in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// Return the index of the maximum value in the logits.
pub fn argmax(logits: &[f32]) -> u32 {
    let mut best_idx = 0u32;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best_idx = i as u32;
        }
    }
    best_idx
}

/// Per-turn token sampler.
///
/// Tokens passed to [`accept`](Self::accept) feed the repetition penalties;
/// only the last `penalty_last_n` of them are remembered.
pub struct Sampler {
    params: SamplingParams,
    vocab_size: usize,
    rng: XorShiftRng,
    recent: VecDeque<u32>,
}

impl Sampler {
    pub fn new(params: &SamplingParams, vocab_size: usize) -> Result<Self, InferenceError> {
        params.validate()?;
        if vocab_size == 0 {
            return Err(InferenceError::SamplerInit("vocabulary is empty".to_string()));
        }
        let rng = match params.seed {
            Some(seed) => XorShiftRng::new(seed),
            None => XorShiftRng::from_entropy(),
        };
        Ok(Self {
            params: params.clone(),
            vocab_size,
            rng,
            recent: VecDeque::with_capacity(params.penalty_last_n),
        })
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Record a token chosen for the output.
    pub fn accept(&mut self, token: u32) {
        if self.params.penalty_last_n == 0 {
            return;
        }
        if self.recent.len() == self.params.penalty_last_n {
            self.recent.pop_front();
        }
        self.recent.push_back(token);
    }

    /// Choose the next token from a logits row.
    ///
    /// Steps:
    /// 1. Repetition, frequency and presence penalties over recent tokens.
    /// 2. If temperature == 0.0, return argmax (greedy).
    /// 3. Top-K: sort, keep top-k candidates.
    /// 4. Temperature scaling and softmax over remaining candidates.
    /// 5. Min-P, then Top-P cutoff, renormalize.
    /// 6. Sample from categorical distribution.
    pub fn sample(&mut self, logits: &[f32]) -> u32 {
        let logits = &logits[..logits.len().min(self.vocab_size)];
        if logits.is_empty() {
            return 0;
        }

        let mut penalized;
        let logits = if self.has_penalties() {
            penalized = logits.to_vec();
            self.apply_penalties(&mut penalized);
            penalized.as_slice()
        } else {
            logits
        };

        if self.params.temperature <= 0.0 {
            return argmax(logits);
        }

        let mut candidates: Vec<(u32, f32)> = logits
            .iter()
            .enumerate()
            .map(|(i, &l)| (i as u32, l))
            .collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        if self.params.top_k > 0 && self.params.top_k < candidates.len() {
            candidates.truncate(self.params.top_k);
        }

        // Softmax over candidates (sorted descending, so [0] is the max)
        let temperature = self.params.temperature;
        let max_logit = candidates[0].1 / temperature;
        let mut probs: Vec<(u32, f32)> = candidates
            .iter()
            .map(|&(idx, logit)| (idx, (logit / temperature - max_logit).exp()))
            .collect();
        normalize(&mut probs);

        if self.params.min_p > 0.0 {
            let floor = probs[0].1 * self.params.min_p;
            let keep = probs.iter().take_while(|c| c.1 >= floor).count().max(1);
            probs.truncate(keep);
        }

        if self.params.top_p < 1.0 {
            let mut cumulative = 0.0f32;
            let mut cutoff_idx = probs.len();
            for (i, &(_, p)) in probs.iter().enumerate() {
                cumulative += p;
                if cumulative >= self.params.top_p {
                    cutoff_idx = i + 1;
                    break;
                }
            }
            probs.truncate(cutoff_idx);
        }
        normalize(&mut probs);

        let r = self.rng.next_f32();
        let mut cumulative = 0.0f32;
        for &(idx, p) in &probs {
            cumulative += p;
            if r < cumulative {
                return idx;
            }
        }

        // Fallback: return last candidate
        probs.last().map(|c| c.0).unwrap_or(0)
    }

    fn has_penalties(&self) -> bool {
        !self.recent.is_empty()
            && (self.params.repeat_penalty != 1.0
                || self.params.frequency_penalty != 0.0
                || self.params.presence_penalty != 0.0)
    }

    fn apply_penalties(&self, logits: &mut [f32]) {
        let mut counts: Vec<(u32, u32)> = Vec::new();
        for &token in &self.recent {
            match counts.iter_mut().find(|(t, _)| *t == token) {
                Some((_, n)) => *n += 1,
                None => counts.push((token, 1)),
            }
        }

        for (token, count) in counts {
            let Some(logit) = logits.get_mut(token as usize) else {
                continue;
            };
            if *logit > 0.0 {
                *logit /= self.params.repeat_penalty;
            } else {
                *logit *= self.params.repeat_penalty;
            }
            *logit -= count as f32 * self.params.frequency_penalty + self.params.presence_penalty;
        }
    }
}

fn normalize(probs: &mut [(u32, f32)]) {
    let sum: f32 = probs.iter().map(|c| c.1).sum();
    if sum > 0.0 {
        for c in probs.iter_mut() {
            c.1 /= sum;
        }
    }
}
