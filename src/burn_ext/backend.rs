use burn::{
    backend::{
        autodiff::{
            checkpoint::{base::Checkpointer, strategy::CheckpointStrategy},
            grads::Gradients,
            ops::{unary, Backward, Ops, OpsKind},
        },
        ndarray::FloatNdArrayElement,
        Autodiff, NdArray, Wgpu,
    },
    tensor::{
        backend::AutodiffBackend,
        ops::{FloatTensor, FloatTensorOps, IntTensor, IntTensorOps},
        Data, ElementConversion, Shape,
    },
};
use tracing::debug;

use crate::{
    engine::{CtcEngine, CtcOptions, CtcProblem, Workspace},
    error::{CtcError, Result},
    labels::SparseLabels,
};

/// Settings of one warp ctc loss invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WarpCtcOptions {
    /// Merge repeated labels before computing the loss.
    pub preprocess_collapse_repeated: bool,
    pub engine: CtcOptions,
}

/// Options of the loss together with the engine built from them, so the engine and
/// its thread pool are reused across invocations.
#[derive(Debug)]
pub struct WarpCtc {
    options: WarpCtcOptions,
    engine: CtcEngine,
}

impl WarpCtc {
    pub fn new(options: WarpCtcOptions) -> Result<Self> {
        let engine = CtcEngine::new(options.engine.clone())?;
        Ok(Self { options, engine })
    }

    pub fn options(&self) -> &WarpCtcOptions {
        &self.options
    }

    pub fn engine(&self) -> &CtcEngine {
        &self.engine
    }
}

pub trait Backend: burn::tensor::backend::Backend {
    /// CTC loss and its gradient with respect to `activations`.
    ///
    /// # Shapes
    ///   - activations `[max_time, batch_size, num_classes]`
    ///   - labels_indices `[num_labels, 2]`, `(batch, position)` pairs grouped by batch
    ///   - labels_values `[num_labels]`
    ///   - sequence_length `[batch_size]`
    ///   - output loss `[batch_size]`, gradient like `activations`
    fn warp_ctc_loss(
        activations: FloatTensor<Self, 3>,
        labels_indices: IntTensor<Self, 2>,
        labels_values: IntTensor<Self, 1>,
        sequence_length: IntTensor<Self, 1>,
        ctc: &WarpCtc,
    ) -> Result<(FloatTensor<Self, 1>, FloatTensor<Self, 3>)> {
        let device = Self::float_device(&activations);
        let [max_time, batch_size, num_classes] = Self::float_shape(&activations).dims;

        let [_, index_width] = Self::int_shape(&labels_indices).dims;
        if index_width != 2 {
            return Err(CtcError::ShapeMismatch {
                what: "label index columns",
                expected: 2,
                got: index_width,
            });
        }
        let [num_lengths] = Self::int_shape(&sequence_length).dims;
        if num_lengths != batch_size {
            return Err(CtcError::ShapeMismatch {
                what: "sequence lengths",
                expected: batch_size,
                got: num_lengths,
            });
        }

        // one host transfer per input
        let indices: Vec<i64> = Self::int_into_data(labels_indices)
            .read()
            .value
            .into_iter()
            .map(|v| v.elem::<i64>())
            .collect();
        let values: Vec<i64> = Self::int_into_data(labels_values)
            .read()
            .value
            .into_iter()
            .map(|v| v.elem::<i64>())
            .collect();
        let lengths = Self::int_into_data(sequence_length)
            .read()
            .value
            .into_iter()
            .enumerate()
            .map(|(batch, v)| {
                let length = v.elem::<i64>();
                usize::try_from(length).map_err(|_| CtcError::SequenceLengthOutOfRange {
                    batch,
                    length,
                    max_time,
                })
            })
            .collect::<Result<Vec<usize>>>()?;

        let labels = SparseLabels::from_flat(&indices, values)?.group(batch_size)?;
        let labels = if ctc.options().preprocess_collapse_repeated {
            labels.collapse_repeated()
        } else {
            labels
        };

        let activations: Vec<f32> = Self::float_into_data(activations)
            .read()
            .value
            .into_iter()
            .map(|v| v.elem::<f32>())
            .collect();

        let problem = CtcProblem {
            activations: &activations,
            max_time,
            minibatch: batch_size,
            alphabet_size: num_classes,
            labels: &labels,
            input_lengths: &lengths,
        };
        let engine = ctc.engine();
        problem.validate(engine.options())?;

        let bytes = engine.workspace_size(labels.lengths(), &lengths, num_classes, batch_size)?;
        debug!(
            max_time,
            batch_size,
            num_classes,
            workspace_bytes = bytes,
            "running warp ctc loss"
        );

        let mut costs = vec![0.0; batch_size];
        let mut gradient = vec![0.0; activations.len()];
        {
            let mut workspace = Workspace::allocate(bytes)?;
            engine.compute(
                &problem,
                &mut workspace,
                &mut costs,
                Some(gradient.as_mut_slice()),
            )?;
        }

        let loss = Data::new(
            costs.into_iter().map(|v| v.elem::<Self::FloatElem>()).collect(),
            Shape::new([batch_size]),
        );
        let gradient = Data::new(
            gradient
                .into_iter()
                .map(|v| v.elem::<Self::FloatElem>())
                .collect(),
            Shape::new([max_time, batch_size, num_classes]),
        );

        Ok((
            Self::float_from_data(loss, &device),
            Self::float_from_data(gradient, &device),
        ))
    }
}

impl<E: FloatNdArrayElement> Backend for NdArray<E> {}

impl Backend for Wgpu {}

impl<B: Backend, C: CheckpointStrategy> Backend for Autodiff<B, C> {
    fn warp_ctc_loss(
        activations: FloatTensor<Self, 3>,
        labels_indices: IntTensor<Self, 2>,
        labels_values: IntTensor<Self, 1>,
        sequence_length: IntTensor<Self, 1>,
        ctc: &WarpCtc,
    ) -> Result<(FloatTensor<Self, 1>, FloatTensor<Self, 3>)> {
        #[derive(Debug)]
        struct WarpCtcBackward;

        impl<B: Backend> Backward<B, 1, 1> for WarpCtcBackward {
            type State = B::FloatTensorPrimitive<3>;

            fn backward(
                self,
                ops: Ops<Self::State, 1>,
                grads: &mut Gradients,
                _checkpointer: &mut Checkpointer,
            ) {
                let gradient = ops.state;

                unary::<B, 1, 3, _>(ops.parents, ops.node, grads, |grad| {
                    let [batch_size] = B::float_shape(&grad).dims;

                    B::float_mul(
                        gradient,
                        B::float_reshape(grad, Shape::from([1, batch_size, 1])),
                    )
                });
            }
        }

        let (loss, gradient) = B::warp_ctc_loss(
            activations.primitive.clone(),
            labels_indices,
            labels_values,
            sequence_length,
            ctc,
        )?;

        // the gradient output itself is not tracked
        let gradient_output = <Self as AutodiffBackend>::from_inner(gradient.clone());

        let loss = match WarpCtcBackward
            .prepare::<C>([activations.node.clone()])
            .compute_bound()
            .stateful()
        {
            OpsKind::Tracked(prep) => prep.finish(gradient, loss),
            OpsKind::UnTracked(prep) => prep.finish(loss),
        };

        Ok((loss, gradient_output))
    }
}
