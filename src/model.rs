use std::mem::size_of;
use std::rc::Rc;

use anyhow::Result;
use lazy_static::lazy_static;
use nalgebra_glm as glm;
use vulkanalia::prelude::v1_0::*;

use crate::device::DeviceContext;
use crate::memory::Buffer;
use crate::transfer::Transfer;

#[repr(C)]
#[derive(Clone, Debug, Copy, PartialEq)]
pub struct Vertex {
    pub pos: glm::Vec3,
    pub color: glm::Vec3,
    pub tex_coord: glm::Vec2,
}

impl Vertex {
    pub fn new(pos: glm::Vec3, color: glm::Vec3, tex_coord: glm::Vec2) -> Self {
        Self { pos, color, tex_coord }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        let pos = vk::VertexInputAttributeDescription::builder()
            .binding(0)
            .location(0)
            .format(vk::Format::R32G32B32_SFLOAT)
            .offset(0)
            .build();
        let color = vk::VertexInputAttributeDescription::builder()
            .binding(0)
            .location(1)
            .format(vk::Format::R32G32B32_SFLOAT)
            .offset(size_of::<glm::Vec3>() as u32)
            .build();
        let tex_coord = vk::VertexInputAttributeDescription::builder()
            .binding(0)
            .location(2)
            .format(vk::Format::R32G32_SFLOAT)
            .offset((size_of::<glm::Vec3>() * 2) as u32)
            .build();
        [pos, color, tex_coord]
    }
}

fn face(corners: [[f32; 3]; 4], colors: [[f32; 3]; 4]) -> [Vertex; 4] {
    let uvs = [[0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]];
    let mut vertices = [Vertex::new(glm::Vec3::zeros(), glm::Vec3::zeros(), glm::Vec2::zeros()); 4];
    for (i, vertex) in vertices.iter_mut().enumerate() {
        *vertex = Vertex::new(glm::make_vec3(&corners[i]), glm::make_vec3(&colors[i]), glm::make_vec2(&uvs[i]));
    }
    vertices
}

const RED: [f32; 3] = [1.0, 0.0, 0.0];
const GREEN: [f32; 3] = [0.0, 1.0, 0.0];
const BLUE: [f32; 3] = [0.0, 0.0, 1.0];
const WHITE: [f32; 3] = [1.0, 1.0, 1.0];
const FACE_COLORS: [[f32; 3]; 4] = [RED, GREEN, BLUE, WHITE];

lazy_static! {
    /// Unit cube, four vertices per face. Each face's corners run
    /// counter-clockwise seen from outside.
    pub static ref VERTICES: Vec<Vertex> = [
        // +Z
        face([[-0.5, -0.5,  0.5], [ 0.5, -0.5,  0.5], [ 0.5,  0.5,  0.5], [-0.5,  0.5,  0.5]], FACE_COLORS),
        // -Z
        face([[ 0.5, -0.5, -0.5], [-0.5, -0.5, -0.5], [-0.5,  0.5, -0.5], [ 0.5,  0.5, -0.5]], FACE_COLORS),
        // +X
        face([[ 0.5, -0.5,  0.5], [ 0.5, -0.5, -0.5], [ 0.5,  0.5, -0.5], [ 0.5,  0.5,  0.5]], FACE_COLORS),
        // -X
        face([[-0.5, -0.5, -0.5], [-0.5, -0.5,  0.5], [-0.5,  0.5,  0.5], [-0.5,  0.5, -0.5]], FACE_COLORS),
        // +Y
        face([[-0.5,  0.5,  0.5], [ 0.5,  0.5,  0.5], [ 0.5,  0.5, -0.5], [-0.5,  0.5, -0.5]], FACE_COLORS),
        // -Y
        face([[-0.5, -0.5, -0.5], [ 0.5, -0.5, -0.5], [ 0.5, -0.5,  0.5], [-0.5, -0.5,  0.5]], FACE_COLORS),
    ]
    .concat();
}

/// Two triangles per face.
#[rustfmt::skip]
pub const INDICES: &[u32] = &[
    0,  1,  2,  2,  3,  0,
    4,  5,  6,  6,  7,  4,
    8,  9,  10, 10, 11, 8,
    12, 13, 14, 14, 15, 12,
    16, 17, 18, 18, 19, 16,
    20, 21, 22, 22, 23, 20,
];

/// Device-local vertex and index buffers, filled once through staging buffers.
#[derive(Debug)]
pub struct GeometryBuffer {
    pub vertices: Buffer,
    pub indices: Buffer,
    pub index_count: u32,
}

impl GeometryBuffer {
    pub unsafe fn create(
        context: &Rc<DeviceContext>,
        transfer: &Transfer,
        vertices: &[Vertex],
        indices: &[u32],
    ) -> Result<Self> {
        let vertex_buffer = upload(context, transfer, vertices, vk::BufferUsageFlags::VERTEX_BUFFER)?;
        let index_buffer = upload(context, transfer, indices, vk::BufferUsageFlags::INDEX_BUFFER)?;
        Ok(Self { vertices: vertex_buffer, indices: index_buffer, index_count: indices.len() as u32 })
    }
}

unsafe fn upload<T: Copy>(
    context: &Rc<DeviceContext>,
    transfer: &Transfer,
    data: &[T],
    usage: vk::BufferUsageFlags,
) -> Result<Buffer> {
    let staging = Buffer::staging(context, data)?;
    let buffer = Buffer::create(
        context,
        staging.size,
        vk::BufferUsageFlags::TRANSFER_DST | usage,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;
    transfer.copy_buffer(staging.handle(), buffer.handle(), staging.size)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    #[test]
    fn vertex_layout_matches_attributes() {
        assert_eq!(size_of::<Vertex>(), 32);
        assert_eq!(align_of::<Vertex>(), 4);
        let attributes = Vertex::attribute_descriptions();
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[2].offset, 24);
        assert_eq!(Vertex::binding_description().stride, 32);
    }

    #[test]
    fn cube_has_six_indexed_quads() {
        assert_eq!(VERTICES.len(), 24);
        assert_eq!(INDICES.len(), 36);
        assert!(INDICES.iter().all(|i| (*i as usize) < VERTICES.len()));
        for (face, quad) in INDICES.chunks(6).enumerate() {
            let base = 4 * face as u32;
            assert!(quad.iter().all(|i| (base..base + 4).contains(i)));
        }
    }

    #[test]
    fn every_triangle_faces_outward() {
        for triangle in INDICES.chunks(3) {
            let a = VERTICES[triangle[0] as usize].pos;
            let b = VERTICES[triangle[1] as usize].pos;
            let c = VERTICES[triangle[2] as usize].pos;
            let normal = (b - a).cross(&(c - a));
            let centroid = (a + b + c) / 3.0;
            assert!(normal.dot(&centroid) > 0.0, "triangle {:?} winds inward", triangle);
        }
    }

    #[test]
    fn vertices_lie_on_the_unit_cube() {
        for vertex in VERTICES.iter() {
            assert!(vertex.pos.iter().all(|c| c.abs() == 0.5));
        }
    }
}
