/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use accel::AccelError;
use accel::Device;
use accel::DeviceBuffer;

use crate::element::Element;

/// Device buffers for one collective in one round.
///
/// The buffers are owned by the allocating participant and released with
/// [`OpBuffers::free`] once the round's verification is done. For in-place
/// operations input and output are the same allocation.
#[derive(Debug)]
pub struct OpBuffers {
    input: DeviceBuffer,
    output: Option<DeviceBuffer>,
    input_len: usize,
    output_len: usize,
}

impl OpBuffers {
    /// Allocate an input of `input_len` elements and a separate output of
    /// `output_len` elements.
    pub fn allocate<T: Element>(
        device: &Device,
        input_len: usize,
        output_len: usize,
    ) -> Result<Self, AccelError> {
        let input = device.allocate(byte_len::<T>(input_len)?)?;
        let output = device.allocate(byte_len::<T>(output_len)?)?;
        Ok(Self {
            input,
            output: Some(output),
            input_len,
            output_len,
        })
    }

    /// Allocate one buffer of `len` elements that is both input and output.
    pub fn allocate_in_place<T: Element>(device: &Device, len: usize) -> Result<Self, AccelError> {
        let input = device.allocate(byte_len::<T>(len)?)?;
        Ok(Self {
            input,
            output: None,
            input_len: len,
            output_len: len,
        })
    }

    pub fn input(&self) -> &DeviceBuffer {
        &self.input
    }

    pub fn output(&self) -> &DeviceBuffer {
        self.output.as_ref().unwrap_or(&self.input)
    }

    pub fn input_len(&self) -> usize {
        self.input_len
    }

    pub fn output_len(&self) -> usize {
        self.output_len
    }

    /// Synchronously copy `values` into the input. Must complete before any
    /// collective reading the input is submitted.
    pub fn populate<T: Element>(&self, device: &Device, values: &[T]) -> Result<(), AccelError> {
        device.copy_host_to_device(&self.input, &T::encode(values))
    }

    /// Synchronously fill the output with `values`. For an in-place pair this
    /// writes the shared buffer.
    pub fn prefill_output<T: Element>(
        &self,
        device: &Device,
        values: &[T],
    ) -> Result<(), AccelError> {
        device.copy_host_to_device(self.output(), &T::encode(values))
    }

    /// Copy the output back to the host. Only meaningful after the stream
    /// the collective ran on has been drained.
    pub fn read_output<T: Element>(&self, device: &Device) -> Result<Vec<T>, AccelError> {
        let mut bytes = vec![0u8; self.output_len * T::DATA_TYPE.size()];
        device.copy_device_to_host(&mut bytes, self.output())?;
        Ok(T::decode(&bytes))
    }

    pub fn free(self) {
        self.input.free();
        if let Some(output) = self.output {
            output.free();
        }
    }
}

fn byte_len<T: Element>(count: usize) -> Result<usize, AccelError> {
    let element_size = T::DATA_TYPE.size();
    count
        .checked_mul(element_size)
        .ok_or(AccelError::SizeOverflow {
            count,
            element_size,
        })
}

#[cfg(test)]
mod tests {
    use accel::DeviceIndex;
    use accel::Runtime;

    use super::*;

    #[test]
    fn lifecycle() {
        let device = Runtime::new(1).select_device(DeviceIndex(0)).unwrap();
        let buffers = OpBuffers::allocate::<f32>(&device, 2, 4).unwrap();
        assert_eq!(buffers.input().nbytes(), 8);
        assert_eq!(buffers.output().nbytes(), 16);
        assert!(!buffers.input().aliases(buffers.output()));

        buffers.populate(&device, &[1.0f32, 2.0]).unwrap();
        buffers
            .prefill_output(&device, &[0.5f32, 0.5, 0.5, 0.5])
            .unwrap();
        assert_eq!(
            buffers.read_output::<f32>(&device).unwrap(),
            vec![0.5, 0.5, 0.5, 0.5]
        );
        assert_eq!(device.memory_stats().live_allocations, 2);
        buffers.free();
        assert_eq!(device.memory_stats().live_allocations, 0);
    }

    #[test]
    fn oversized_request() {
        let device = Runtime::new(1).select_device(DeviceIndex(0)).unwrap();
        assert!(matches!(
            OpBuffers::allocate::<f64>(&device, 1, usize::MAX / 4),
            Err(AccelError::SizeOverflow { element_size: 8, .. })
        ));
        assert!(matches!(
            OpBuffers::allocate_in_place::<f32>(&device, usize::MAX),
            Err(AccelError::SizeOverflow { element_size: 4, .. })
        ));
        assert_eq!(device.memory_stats().live_allocations, 0);
    }

    #[test]
    fn in_place() {
        let device = Runtime::new(1).select_device(DeviceIndex(0)).unwrap();
        let buffers = OpBuffers::allocate_in_place::<f64>(&device, 1).unwrap();
        assert!(buffers.input().aliases(buffers.output()));
        buffers.populate(&device, &[42.0f64]).unwrap();
        assert_eq!(buffers.read_output::<f64>(&device).unwrap(), vec![42.0]);
        assert_eq!(device.memory_stats().live_allocations, 1);
        buffers.free();
        assert_eq!(device.memory_stats().live_allocations, 0);
    }

    #[test]
    fn zero_elements() {
        let device = Runtime::new(1).select_device(DeviceIndex(0)).unwrap();
        let buffers = OpBuffers::allocate::<f32>(&device, 0, 0).unwrap();
        buffers.populate::<f32>(&device, &[]).unwrap();
        assert!(buffers.read_output::<f32>(&device).unwrap().is_empty());
        buffers.free();
    }
}
