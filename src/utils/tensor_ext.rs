use core::ops::Range;

use burn::tensor::{
    backend::Backend, Data, Element, ElementConversion, Int, Numeric, Shape, Tensor,
};

/// Pad every dimension of `tensor` with `fill_value`, `(before, after)` per dimension.
pub fn pad<const D: usize, K, E, B>(
    tensor: Tensor<B, D, K>,
    pad_width: [(usize, usize); D],
    fill_value: E,
) -> Tensor<B, D, K>
where
    B: Backend,
    K: Numeric<B>,
    K::Elem: Element,
    E: ElementConversion,
{
    let device = tensor.device();
    let origin_shape = tensor.dims();

    let pad_shape: [usize; D] = core::array::from_fn(|idx| {
        let (left_pad, right_pad) = pad_width[idx];
        origin_shape[idx] + left_pad + right_pad
    });
    let assign_range: [Range<usize>; D] = core::array::from_fn(|idx| {
        let left_pad = pad_width[idx].0;
        left_pad..(left_pad + origin_shape[idx])
    });

    let padded = Tensor::<B, D, K>::full(pad_shape, fill_value, &device);

    padded.slice_assign::<D>(assign_range, tensor)
}

pub fn float_tensor<B: Backend, const D: usize>(
    values: Vec<f32>,
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D> {
    let data = Data::new(values, Shape::new(shape)).convert::<B::FloatElem>();
    Tensor::from_data(data, device)
}

pub fn int_tensor<B: Backend, const D: usize>(
    values: Vec<i64>,
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D, Int> {
    let data = Data::new(values, Shape::new(shape)).convert::<B::IntElem>();
    Tensor::from_data(data, device)
}

/// Read a float tensor back to the host as `f32`.
pub fn float_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor
        .into_data()
        .value
        .into_iter()
        .map(|v| v.elem::<f32>())
        .collect()
}

/// Read an int tensor back to the host as `i64`.
pub fn int_values<B: Backend, const D: usize>(tensor: Tensor<B, D, Int>) -> Vec<i64> {
    tensor
        .into_data()
        .value
        .into_iter()
        .map(|v| v.elem::<i64>())
        .collect()
}

#[cfg(test)]
mod test {
    use burn::backend::NdArray;

    use super::*;

    type TestBackend = NdArray;

    #[test]
    fn test_pad_time_axis() {
        let device = Default::default();
        let tensor = float_tensor::<TestBackend, 3>(vec![1.0, 2.0, 3.0, 4.0], [2, 1, 2], &device);
        let padded = pad(tensor, [(0, 2), (0, 0), (0, 0)], 0.0);

        assert_eq!(padded.dims(), [4, 1, 2]);
        assert_eq!(
            float_values(padded),
            vec![1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_int_round_trip() {
        let device = Default::default();
        let tensor = int_tensor::<TestBackend, 2>(vec![0, 1, 1, 0], [2, 2], &device);
        assert_eq!(tensor.dims(), [2, 2]);
        assert_eq!(int_values(tensor), vec![0, 1, 1, 0]);
    }
}
