//! Parameters of one attention stream
//!
//! Dual-stream blocks carry two copies of the same layer set, one for the
//! image (`x`) and one for the caption (`c`). Single-stream blocks carry
//! one.

use burn_dit_convert::Layer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLayers {
    pub q: Layer,
    pub k: Layer,
    pub v: Layer,
    pub norm_q: Layer,
    pub norm_k: Layer,
    /// Attention output projection
    pub out: Layer,
    /// Feed-forward input projections, gate first
    pub up: Vec<Layer>,
    pub down: Layer,
    /// Modulation chunks, in the order the block consumes them
    pub ada_ln: Vec<Layer>,
}

impl StreamLayers {
    /// Biased projections with a GELU MLP
    pub fn gelu(stream: &str, index: usize, modulation: usize) -> Self {
        let layer = |name: &str| Layer::new(&format!("{stream}_{name}"), index);
        Self {
            q: layer("q"),
            k: layer("k"),
            v: layer("v"),
            norm_q: Layer::no_bias(&format!("{stream}_norm_q"), index),
            norm_k: Layer::no_bias(&format!("{stream}_norm_k"), index),
            out: layer("o"),
            up: vec![layer("linear1")],
            down: layer("out_proj"),
            ada_ln: (0..modulation)
                .map(|i| layer(&format!("ada_ln_{i}")))
                .collect(),
        }
    }

    /// Bias-free projections with a SwiGLU MLP
    pub fn swiglu(stream: &str, index: usize, modulation: usize) -> Self {
        let layer = |name: &str| Layer::no_bias(&format!("{stream}_{name}"), index);
        Self {
            q: layer("q"),
            k: layer("k"),
            v: layer("v"),
            norm_q: layer("norm_q"),
            norm_k: layer("norm_k"),
            out: layer("o"),
            up: vec![layer("w1"), layer("w3")],
            down: layer("w2"),
            ada_ln: (0..modulation)
                .map(|i| layer(&format!("ada_ln_{i}")))
                .collect(),
        }
    }

    pub fn qkv(&self) -> [&Layer; 3] {
        [&self.q, &self.k, &self.v]
    }

    pub fn ada_ln(&self) -> Vec<&Layer> {
        self.ada_ln.iter().collect()
    }

    pub fn up(&self) -> Vec<&Layer> {
        self.up.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_dit_convert::ParameterId;

    #[test]
    fn test_gelu_stream_names() {
        let s = StreamLayers::gelu("x", 3, 6);
        assert_eq!(s.q.weight, ParameterId::weight("x_q", 3));
        assert_eq!(s.q.bias, Some(ParameterId::bias("x_q", 3)));
        assert_eq!(s.norm_k.bias, None);
        assert_eq!(s.ada_ln.len(), 6);
        assert_eq!(s.ada_ln[5].weight, ParameterId::weight("x_ada_ln_5", 3));
    }

    #[test]
    fn test_swiglu_stream_has_no_biases() {
        let s = StreamLayers::swiglu("c", 0, 0);
        assert!(s.qkv().iter().all(|l| l.bias.is_none()));
        assert_eq!(s.up.len(), 2);
        assert!(s.ada_ln.is_empty());
    }
}
