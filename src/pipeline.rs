use std::mem::size_of_val;
use std::rc::Rc;

use anyhow::{anyhow, Result};
use log::*;
use vulkanalia::prelude::v1_0::*;

use crate::device::DeviceContext;
use crate::error::EngineError;
use crate::model::Vertex;
use crate::owned::Owned;

const VERTEX_SHADER: &str = include_str!("../shaders/shader.vert");
const FRAGMENT_SHADER: &str = include_str!("../shaders/shader.frag");

/// Attachment slots in the render pass and in every framebuffer.
pub const COLOR_ATTACHMENT: u32 = 0;
pub const DEPTH_ATTACHMENT: u32 = 1;
pub const RESOLVE_ATTACHMENT: u32 = 2;

/// Render pass, descriptor layout and the one graphics pipeline.
///
/// Viewport and scissor are dynamic, so none of this depends on the
/// swapchain extent and it survives swapchain recreation untouched.
#[derive(Debug)]
pub struct Pipeline {
    pipeline: Owned<vk::Pipeline>,
    layout: Owned<vk::PipelineLayout>,
    descriptor_set_layout: Owned<vk::DescriptorSetLayout>,
    render_pass: Owned<vk::RenderPass>,
}

impl Pipeline {
    pub unsafe fn create(context: &Rc<DeviceContext>, color_format: vk::Format) -> Result<Self> {
        let render_pass = create_render_pass(context, color_format)?;
        let descriptor_set_layout = create_descriptor_set_layout(context)?;

        let set_layouts = &[descriptor_set_layout.handle()];
        let info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);
        let layout = Owned::new(context, context.device().create_pipeline_layout(&info, None)?);

        let pipeline = create_pipeline(context, render_pass.handle(), layout.handle())?;
        if context.validation() {
            debug!("Created graphics pipeline ({:?} samples).", context.msaa_samples);
        }
        Ok(Self { pipeline, layout, descriptor_set_layout, render_pass })
    }

    #[inline]
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline.handle()
    }

    #[inline]
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout.handle()
    }

    #[inline]
    pub fn descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.descriptor_set_layout.handle()
    }

    #[inline]
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass.handle()
    }
}

/// Which attachment the subpass draws into and which, if any, it resolves to.
/// Single-sampled devices draw straight into the swapchain image.
pub fn subpass_targets(samples: vk::SampleCountFlags) -> (u32, Option<u32>) {
    if samples == vk::SampleCountFlags::_1 {
        (RESOLVE_ATTACHMENT, None)
    } else {
        (COLOR_ATTACHMENT, Some(RESOLVE_ATTACHMENT))
    }
}

unsafe fn create_render_pass(context: &Rc<DeviceContext>, color_format: vk::Format) -> Result<Owned<vk::RenderPass>> {
    let samples = context.msaa_samples;
    let (color_target, resolve_target) = subpass_targets(samples);

    let color_attachment = vk::AttachmentDescription::builder()
        .format(color_format)
        .samples(samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    let depth_stencil_attachment = vk::AttachmentDescription::builder()
        .format(context.depth_format)
        .samples(samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    let load_op = if resolve_target.is_some() {
        vk::AttachmentLoadOp::DONT_CARE
    } else {
        vk::AttachmentLoadOp::CLEAR
    };
    let resolve_attachment = vk::AttachmentDescription::builder()
        .format(color_format)
        .samples(vk::SampleCountFlags::_1)
        .load_op(load_op)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(color_target)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    let depth_stencil_attachment_ref = vk::AttachmentReference::builder()
        .attachment(DEPTH_ATTACHMENT)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    let resolve_attachment_refs = resolve_target
        .map(|attachment| {
            vk::AttachmentReference::builder()
                .attachment(attachment)
                .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .build()
        })
        .into_iter()
        .collect::<Vec<_>>();

    let color_attachments = &[color_attachment_ref];
    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(color_attachments)
        .depth_stencil_attachment(&depth_stencil_attachment_ref);
    if !resolve_attachment_refs.is_empty() {
        subpass = subpass.resolve_attachments(&resolve_attachment_refs);
    }

    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE);

    let attachments = &[color_attachment, depth_stencil_attachment, resolve_attachment];
    let subpasses = &[subpass];
    let dependencies = &[dependency];
    let info = vk::RenderPassCreateInfo::builder()
        .attachments(attachments)
        .subpasses(subpasses)
        .dependencies(dependencies);
    Ok(Owned::new(context, context.device().create_render_pass(&info, None)?))
}

/// Binding 0: the uniform payload for the vertex stage. Binding 1: the
/// texture for the fragment stage.
unsafe fn create_descriptor_set_layout(context: &Rc<DeviceContext>) -> Result<Owned<vk::DescriptorSetLayout>> {
    let ubo_binding = vk::DescriptorSetLayoutBinding::builder()
        .binding(0)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .descriptor_count(1)
        .stage_flags(vk::ShaderStageFlags::VERTEX);
    let sampler_binding = vk::DescriptorSetLayoutBinding::builder()
        .binding(1)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .descriptor_count(1)
        .stage_flags(vk::ShaderStageFlags::FRAGMENT);

    let bindings = &[ubo_binding, sampler_binding];
    let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
    Ok(Owned::new(context, context.device().create_descriptor_set_layout(&info, None)?))
}

unsafe fn create_pipeline(
    context: &Rc<DeviceContext>,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
) -> Result<Owned<vk::Pipeline>> {
    let compiler = shaderc::Compiler::new().ok_or_else(|| anyhow!(EngineError::ShaderCompiler))?;
    let vert = compile_shader(&compiler, VERTEX_SHADER, shaderc::ShaderKind::Vertex, "shader.vert")?;
    let frag = compile_shader(&compiler, FRAGMENT_SHADER, shaderc::ShaderKind::Fragment, "shader.frag")?;
    // Modules are only needed until the pipeline exists.
    let vert_module = create_shader_module(context, &vert)?;
    let frag_module = create_shader_module(context, &frag)?;

    let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vert_module.handle())
        .name(b"main\0");
    let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::FRAGMENT)
        .module(frag_module.handle())
        .name(b"main\0");

    let binding_descriptions = &[Vertex::binding_description()];
    let attribute_descriptions = Vertex::attribute_descriptions();
    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(binding_descriptions)
        .vertex_attribute_descriptions(&attribute_descriptions);

    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    // Counts only; the rectangles are set per frame.
    let mut viewport_state = vk::PipelineViewportStateCreateInfo::builder();
    viewport_state.viewport_count = 1;
    viewport_state.scissor_count = 1;

    let dynamic_states = &[vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(dynamic_states);

    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisample_state = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(context.msaa_samples);

    let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let attachment = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::all())
        .blend_enable(false);
    let attachments = &[attachment];
    let color_blend_state = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .logic_op(vk::LogicOp::COPY)
        .attachments(attachments)
        .blend_constants([0.0, 0.0, 0.0, 0.0]);

    let stages = &[vert_stage, frag_stage];
    let info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .depth_stencil_state(&depth_stencil_state)
        .color_blend_state(&color_blend_state)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0);

    let pipeline = context
        .device()
        .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)?
        .0;
    Ok(Owned::new(context, pipeline))
}

/// Compiles one GLSL stage to SPIR-V words.
pub fn compile_shader(
    compiler: &shaderc::Compiler,
    source: &str,
    kind: shaderc::ShaderKind,
    name: &str,
) -> Result<Vec<u32>> {
    let mut options = shaderc::CompileOptions::new().ok_or_else(|| anyhow!(EngineError::ShaderCompiler))?;
    options.set_optimization_level(shaderc::OptimizationLevel::Performance);
    let artifact = compiler.compile_into_spirv(source, kind, name, "main", Some(&options))?;
    if artifact.get_num_warnings() > 0 {
        warn!("{}: {}", name, artifact.get_warning_messages());
    }
    Ok(artifact.as_binary().to_vec())
}

unsafe fn create_shader_module(context: &Rc<DeviceContext>, code: &[u32]) -> Result<Owned<vk::ShaderModule>> {
    let info = vk::ShaderModuleCreateInfo::builder()
        .code_size(size_of_val(code))
        .code(code);
    Ok(Owned::new(context, context.device().create_shader_module(&info, None)?))
}
