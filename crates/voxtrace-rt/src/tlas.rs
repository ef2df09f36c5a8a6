//! Top-level acceleration structure over BLAS instances.

use crate::blas::{build_single, SingleBuild};
use crate::structure::{AccelerationStructure, INSTANCE_ALIGNMENT};
use ash::vk;
use glam::Mat4;
use voxtrace_gpu::{
    create_buffer_with, BufferRequest, DeferredQueue, Device, GeometryDesc, GpuError,
    MemoryBarrier, Result,
};

/// `VkAccelerationStructureInstanceKHR` as laid out in memory (64 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceRecord {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [f32; 12],
    /// Custom index in the low 24 bits, visibility mask in the high 8.
    pub custom_index_and_mask: u32,
    /// Hit group offset in the low 24 bits, instance flags in the high 8.
    pub sbt_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

/// One instance of a bottom-level structure in the TLAS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TlasInstance {
    pub transform: Mat4,
    pub custom_index: u32,
    pub mask: u8,
    pub flags: vk::GeometryInstanceFlagsKHR,
    pub blas_address: vk::DeviceAddress,
}

impl TlasInstance {
    /// An instance visible to every ray, with culling disabled.
    pub fn new(blas: &AccelerationStructure, transform: Mat4, custom_index: u32) -> Self {
        Self {
            transform,
            custom_index,
            mask: 0xFF,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            blas_address: blas.device_address(),
        }
    }

    pub fn record(&self) -> InstanceRecord {
        // Rows of the matrix are the columns of its transpose.
        let rows = self.transform.transpose().to_cols_array();
        let mut transform = [0.0; 12];
        transform.copy_from_slice(&rows[..12]);

        InstanceRecord {
            transform,
            custom_index_and_mask: (self.custom_index & 0x00FF_FFFF) | u32::from(self.mask) << 24,
            sbt_offset_and_flags: (self.flags.as_raw() & 0xFF) << 24,
            acceleration_structure_reference: self.blas_address,
        }
    }
}

/// Build the top-level structure over `instances`.
///
/// The bottom-level structures are only referenced by address and must
/// outlive the result.
pub fn build_tlas<D: Device>(
    device: &mut D,
    deferred: &mut DeferredQueue,
    instances: &[TlasInstance],
) -> Result<AccelerationStructure> {
    let limit = device.limits().max_instance_count;
    if instances.len() as u64 > limit {
        return Err(GpuError::LimitExceeded {
            what: "instance count",
            requested: instances.len() as u64,
            limit,
        });
    }
    if instances.is_empty() {
        return Err(GpuError::InvalidState("a TLAS needs at least one instance".to_string()));
    }

    let records: Vec<InstanceRecord> = instances.iter().map(TlasInstance::record).collect();
    let instance_buffer = create_buffer_with(
        device,
        deferred,
        &BufferRequest::with_data(
            "tlas instances",
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            bytemuck::cast_slice(&records),
        )
        .aligned(INSTANCE_ALIGNMENT),
        |device, cmd| {
            device.cmd_memory_barrier(cmd, &MemoryBarrier::TRANSFER_TO_BUILD);
            Ok(())
        },
    )?;

    let build = SingleBuild {
        geometry: GeometryDesc::Instances {
            data: instance_buffer.device_address,
        },
        primitive_count: records.len() as u32,
        flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
        name: "tlas",
        // Referenced BLASes were built or compacted by earlier submissions.
        before: &[MemoryBarrier::BUILD_TO_BUILD],
        after: Some(MemoryBarrier::BUILD_TO_SHADER),
    };
    let tlas = build_single(device, deferred, &build, vec![instance_buffer])?;
    tracing::info!("Built TLAS over {} instances ({} bytes)", records.len(), tlas.size());
    Ok(tlas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use voxtrace_gpu::testing::{FakeDevice, RecordedCommand};
    use voxtrace_gpu::RcBuffer;

    fn blas(device: &mut FakeDevice, deferred: &mut DeferredQueue) -> AccelerationStructure {
        let storage = voxtrace_gpu::create_buffer(
            device,
            deferred,
            &BufferRequest::new("blas", crate::blas::STORAGE_USAGE, 1024).aligned(256),
        )
        .unwrap();
        AccelerationStructure::new(
            device,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            &RcBuffer::new(storage),
            0,
            1024,
        )
        .unwrap()
    }

    #[test]
    fn instance_record_is_64_bytes() {
        assert_eq!(std::mem::size_of::<InstanceRecord>(), 64);
    }

    #[test]
    fn record_packs_transform_rows_and_bitfields() {
        let instance = TlasInstance {
            transform: Mat4::from_translation(Vec3::new(64.0, 0.0, -32.0)) * Mat4::from_scale(Vec3::splat(256.0)),
            custom_index: 7,
            mask: 0xFF,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            blas_address: 0xABC0,
        };
        let record = instance.record();

        assert_eq!(
            record.transform,
            [256.0, 0.0, 0.0, 64.0, 0.0, 256.0, 0.0, 0.0, 0.0, 0.0, 256.0, -32.0]
        );
        assert_eq!(record.custom_index_and_mask, 0xFF00_0007);
        assert_eq!(record.sbt_offset_and_flags, 0x0100_0000);
        assert_eq!(record.acceleration_structure_reference, 0xABC0);
    }

    #[test]
    fn tlas_build_frees_inputs_but_not_blas_storage() {
        let mut device = FakeDevice::new();
        device.set_auto_complete(false);
        let mut deferred = DeferredQueue::new();
        let blas = blas(&mut device, &mut deferred);

        let instances: Vec<_> = (0..3)
            .map(|i| TlasInstance::new(&blas, Mat4::from_translation(Vec3::X * i as f32), i))
            .collect();
        let tlas = build_tlas(&mut device, &mut deferred, &instances).unwrap();
        assert_eq!(tlas.level(), vk::AccelerationStructureTypeKHR::TOP_LEVEL);

        let build_cmd = device.submissions().last().unwrap().command_buffer;
        let commands = device.recorded(build_cmd);
        assert_eq!(commands.first(), Some(&RecordedCommand::Barrier(MemoryBarrier::BUILD_TO_BUILD)));
        assert_eq!(commands.last(), Some(&RecordedCommand::Barrier(MemoryBarrier::BUILD_TO_SHADER)));

        device.complete_all();
        deferred.poll_completed(&mut device).unwrap();
        // BLAS storage and TLAS storage.
        assert_eq!(device.live_buffer_count(), 2);
        assert!(device.is_buffer_live(blas.storage().buffer()));

        tlas.destroy(&mut device).unwrap();
        blas.destroy(&mut device).unwrap();
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn instance_limit_is_enforced() {
        let mut device = FakeDevice::new();
        device.limits_mut().max_instance_count = 2;
        let mut deferred = DeferredQueue::new();
        let blas = blas(&mut device, &mut deferred);

        let instances = vec![TlasInstance::new(&blas, Mat4::IDENTITY, 0); 3];
        let err = build_tlas(&mut device, &mut deferred, &instances).unwrap_err();
        assert!(matches!(
            err,
            GpuError::LimitExceeded {
                what: "instance count",
                requested: 3,
                limit: 2
            }
        ));
        assert_eq!(device.live_buffer_count(), 1);
        blas.destroy(&mut device).unwrap();
    }
}
