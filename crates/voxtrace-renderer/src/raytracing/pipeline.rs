//! Ray-tracing pipeline.
//!
//! The pipeline's stages, groups and shader-table layout all come from one
//! ordered group table. Adding a hit group is a new table entry.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use ash::vk;
use tracing::{debug, info};

use crate::device::{PipelineGroup, PipelineStage, RtDevice, RtPipelineDesc};
use crate::error::{RtError, RtResult};
use crate::raytracing::sbt::ShaderBindingTable;
use crate::resources::ResourceManager;

/// Shader-table region a group's record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SbtRegion {
    Raygen,
    Miss,
    Hit,
    Callable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    General,
    TrianglesHit,
    ProceduralHit,
}

/// One entry of the group table. Stage shaders are named by file stem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderGroup {
    pub region: SbtRegion,
    pub kind: GroupKind,
    pub general: Option<&'static str>,
    pub closest_hit: Option<&'static str>,
    pub any_hit: Option<&'static str>,
    pub intersection: Option<&'static str>,
}

impl ShaderGroup {
    const fn general(region: SbtRegion, shader: &'static str) -> Self {
        Self {
            region,
            kind: GroupKind::General,
            general: Some(shader),
            closest_hit: None,
            any_hit: None,
            intersection: None,
        }
    }
}

/// The five groups, in shader-table order:
/// raygen, primary miss, shadow miss, triangle hit, procedural volume hit.
pub const SHADER_GROUPS: &[ShaderGroup] = &[
    ShaderGroup::general(SbtRegion::Raygen, "raygen.rgen"),
    ShaderGroup::general(SbtRegion::Miss, "miss.rmiss"),
    ShaderGroup::general(SbtRegion::Miss, "shadow.rmiss"),
    ShaderGroup {
        region: SbtRegion::Hit,
        kind: GroupKind::TrianglesHit,
        general: None,
        closest_hit: Some("closesthit_triangles.rchit"),
        any_hit: None,
        intersection: None,
    },
    ShaderGroup {
        region: SbtRegion::Hit,
        kind: GroupKind::ProceduralHit,
        general: None,
        closest_hit: Some("closesthit_volume.rchit"),
        any_hit: None,
        intersection: Some("intersection_volume.rint"),
    },
];

/// Records per shader-table region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionCounts {
    pub raygen: u32,
    pub miss: u32,
    pub hit: u32,
    pub callable: u32,
}

impl RegionCounts {
    pub fn total(&self) -> u32 {
        self.raygen + self.miss + self.hit + self.callable
    }
}

/// Check the table and count its records per region.
pub fn validate_groups(groups: &[ShaderGroup]) -> RtResult<RegionCounts> {
    let invalid = |msg: String| Err(RtError::InvalidShaderTable(msg));

    let mut counts = RegionCounts::default();
    let mut previous = SbtRegion::Raygen;
    for (i, group) in groups.iter().enumerate() {
        if group.region < previous {
            return invalid(format!("group {i} ({:?}) is out of region order", group.region));
        }
        previous = group.region;

        let hit_region = group.region == SbtRegion::Hit;
        match group.kind {
            GroupKind::General => {
                if hit_region || group.general.is_none() {
                    return invalid(format!("group {i}: general groups need a shader outside the hit region"));
                }
                if group.closest_hit.is_some() || group.any_hit.is_some() || group.intersection.is_some() {
                    return invalid(format!("group {i}: general group with hit shaders"));
                }
            }
            GroupKind::TrianglesHit | GroupKind::ProceduralHit => {
                if !hit_region || group.general.is_some() {
                    return invalid(format!("group {i}: hit groups belong in the hit region"));
                }
                if group.closest_hit.is_none() && group.any_hit.is_none() {
                    return invalid(format!("group {i}: hit group without hit shaders"));
                }
                let procedural = group.kind == GroupKind::ProceduralHit;
                if procedural != group.intersection.is_some() {
                    return invalid(format!("group {i}: intersection shader required only for procedural hits"));
                }
            }
        }

        match group.region {
            SbtRegion::Raygen => counts.raygen += 1,
            SbtRegion::Miss => counts.miss += 1,
            SbtRegion::Hit => counts.hit += 1,
            SbtRegion::Callable => counts.callable += 1,
        }
    }

    if counts.raygen != 1 {
        return invalid(format!("expected exactly one raygen group, found {}", counts.raygen));
    }
    Ok(counts)
}

/// Stages (deduplicated by shader name) and groups referencing them by index.
pub fn pipeline_layout_of(groups: &[ShaderGroup]) -> (Vec<(&'static str, vk::ShaderStageFlags)>, Vec<PipelineGroup>) {
    let mut stages: Vec<(&'static str, vk::ShaderStageFlags)> = Vec::new();
    let mut stage_index = |name: Option<&'static str>, stage: vk::ShaderStageFlags| -> u32 {
        let Some(name) = name else {
            return vk::SHADER_UNUSED_KHR;
        };
        if let Some(i) = stages.iter().position(|&(n, s)| n == name && s == stage) {
            return i as u32;
        }
        stages.push((name, stage));
        stages.len() as u32 - 1
    };

    let pipeline_groups = groups
        .iter()
        .map(|group| {
            let general_stage = match group.region {
                SbtRegion::Raygen => vk::ShaderStageFlags::RAYGEN_KHR,
                SbtRegion::Miss => vk::ShaderStageFlags::MISS_KHR,
                SbtRegion::Callable | SbtRegion::Hit => vk::ShaderStageFlags::CALLABLE_KHR,
            };
            PipelineGroup {
                ty: match group.kind {
                    GroupKind::General => vk::RayTracingShaderGroupTypeKHR::GENERAL,
                    GroupKind::TrianglesHit => vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
                    GroupKind::ProceduralHit => vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP,
                },
                general: stage_index(group.general, general_stage),
                closest_hit: stage_index(group.closest_hit, vk::ShaderStageFlags::CLOSEST_HIT_KHR),
                any_hit: stage_index(group.any_hit, vk::ShaderStageFlags::ANY_HIT_KHR),
                intersection: stage_index(group.intersection, vk::ShaderStageFlags::INTERSECTION_KHR),
            }
        })
        .collect();

    (stages, pipeline_groups)
}

/// SPIR-V words keyed by shader name.
#[derive(Default)]
pub struct ShaderLibrary {
    modules: HashMap<String, Vec<u32>>,
}

impl ShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `<name>.spv` from `dir` for every shader the group table names.
    pub fn load(dir: &Path, groups: &[ShaderGroup]) -> RtResult<Self> {
        let mut library = Self::new();
        let (stages, _) = pipeline_layout_of(groups);
        for (name, _) in stages {
            if library.modules.contains_key(name) {
                continue;
            }
            let path = dir.join(format!("{name}.spv"));
            let words = read_spirv(&path).map_err(|source| RtError::Shader {
                name: name.to_string(),
                path: path.clone(),
                source,
            })?;
            debug!(shader = name, words = words.len(), "shader loaded");
            library.modules.insert(name.to_string(), words);
        }
        Ok(library)
    }

    pub fn insert(&mut self, name: impl Into<String>, words: Vec<u32>) {
        self.modules.insert(name.into(), words);
    }

    pub fn get(&self, name: &str) -> RtResult<&[u32]> {
        self.modules.get(name).map(Vec::as_slice).ok_or_else(|| RtError::Shader {
            name: name.to_string(),
            path: PathBuf::new(),
            source: io::Error::new(io::ErrorKind::NotFound, "not in shader library"),
        })
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

fn read_spirv(path: &Path) -> io::Result<Vec<u32>> {
    let mut file = File::open(path)?;
    ash::util::read_spv(&mut file)
}

/// The pipeline, its layout and its shader binding table.
pub struct RtPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    sbt: ShaderBindingTable,
    max_recursion_depth: u32,
}

impl RtPipeline {
    /// Build the pipeline from `groups`, with set 0 = `global_layout` and
    /// set 1 = `rt_layout`.
    pub fn new<D: RtDevice>(
        resources: &mut ResourceManager<D>,
        shaders: &ShaderLibrary,
        groups: &[ShaderGroup],
        global_layout: vk::DescriptorSetLayout,
        rt_layout: vk::DescriptorSetLayout,
        max_recursion_depth: u32,
    ) -> RtResult<Self> {
        let counts = validate_groups(groups)?;
        let (stage_names, pipeline_groups) = pipeline_layout_of(groups);
        let max_recursion_depth = max_recursion_depth.min(resources.device().properties().max_ray_recursion_depth);

        let device = resources.device();
        let mut stages = Vec::with_capacity(stage_names.len());
        let modules = stage_names.iter().try_for_each(|&(name, stage)| {
            let module = device.create_shader_module(shaders.get(name)?)?;
            stages.push(PipelineStage { stage, module });
            Ok::<(), RtError>(())
        });

        let pipeline_and_layout = modules.and_then(|()| {
            let layout = device.create_pipeline_layout(&[global_layout, rt_layout])?;
            let pipeline = device.create_rt_pipeline(&RtPipelineDesc {
                stages: &stages,
                groups: &pipeline_groups,
                layout,
                max_recursion_depth,
            });
            match pipeline {
                Ok(pipeline) => Ok((pipeline, layout)),
                Err(e) => {
                    device.destroy_pipeline_layout(layout);
                    Err(e)
                }
            }
        });

        // Modules are only needed while the pipeline is created.
        for stage in &stages {
            device.destroy_shader_module(stage.module);
        }
        let (pipeline, layout) = pipeline_and_layout?;

        let sbt = match ShaderBindingTable::new(resources, pipeline, counts) {
            Ok(sbt) => sbt,
            Err(e) => {
                resources.device().destroy_pipeline(pipeline);
                resources.device().destroy_pipeline_layout(layout);
                return Err(e);
            }
        };

        info!(
            groups = groups.len(),
            stages = stage_names.len(),
            max_recursion_depth,
            "ray tracing pipeline created"
        );
        Ok(Self {
            pipeline,
            layout,
            sbt,
            max_recursion_depth,
        })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn sbt(&self) -> &ShaderBindingTable {
        &self.sbt
    }

    pub fn max_recursion_depth(&self) -> u32 {
        self.max_recursion_depth
    }

    /// Bind the pipeline and sets 0 and 1.
    pub fn bind<D: RtDevice>(
        &self,
        device: &D,
        cmd: vk::CommandBuffer,
        global_set: vk::DescriptorSet,
        rt_set: vk::DescriptorSet,
    ) {
        device.cmd_bind_rt_pipeline(cmd, self.pipeline);
        device.cmd_bind_rt_descriptor_sets(cmd, self.layout, 0, &[global_set, rt_set]);
    }

    pub fn destroy<D: RtDevice>(self, resources: &mut ResourceManager<D>) -> RtResult<()> {
        resources.device().destroy_pipeline(self.pipeline);
        resources.device().destroy_pipeline_layout(self.layout);
        self.sbt.destroy(resources)
    }
}
