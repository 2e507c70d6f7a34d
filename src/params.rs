// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed configuration parameters and the filter-targeted parameter bag.
//!
//! A client-facing component converts its configuration surface into
//! [`FilterParam`]s, each addressed to one stage of the pipeline, and
//! attaches them to the next buffer's metadata. Every stage drains the
//! params addressed to it before processing the buffer; params addressed to
//! [`FilterTarget::Component`] travel upstream on completed work instead
//! (e.g. the per-frame average QP report).

use enumn::N;

use crate::ColorAspects;
use crate::PixelFormat;
use crate::Rect;
use crate::Resolution;

/// Raw parameter indices as delivered by the host configuration surface.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, N)]
#[repr(u32)]
pub enum ParamIndex {
    ProfileLevel = 1,
    Bitrate,
    BitrateMode,
    Framerate,
    IdrPeriod,
    IntraRefresh,
    QpRange,
    DropControl,
    FrameQp,
    AverageQp,
    MvHorizontalRange,
    MvVerticalRange,
    TemporalLayering,
    OperatingRate,
    // H.264 extensions.
    SliceSize,
    EntropyMode,
    MaxIFrameSize,
    // Vendor low-latency extensions.
    LowLatency,
    LtrFrames,
    SarSize,
    BaseLayerPid,
    // CSC stage.
    InputCrop,
    OutputPosition,
    ScaleSize,
    OutputFormat,
    ColorAspects,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BitrateMode {
    #[default]
    ConstantBitrate,
    VariableBitrate,
    ConstantQuality,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum EntropyMode {
    #[default]
    Cavlc,
    Cabac,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct QpRange {
    pub min: u32,
    pub max: u32,
}

/// A configuration value, tagged by [`ParamIndex`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Param {
    ProfileLevel { profile: u32, level: u32 },
    Bitrate(u32),
    BitrateMode(BitrateMode),
    Framerate(u32),
    IdrPeriod(u32),
    IntraRefresh(u32),
    QpRange(QpRange),
    DropControl(bool),
    FrameQp(u32),
    AverageQp(u32),
    MvHorizontalRange(u32),
    MvVerticalRange(u32),
    TemporalLayering { layer_count: u32 },
    OperatingRate(u32),
    SliceSize(u32),
    EntropyMode(EntropyMode),
    MaxIFrameSize(u32),
    LowLatency(bool),
    LtrFrames(u32),
    SarSize { width: u32, height: u32 },
    BaseLayerPid(u32),
    InputCrop(Rect),
    OutputPosition(Rect),
    ScaleSize(Resolution),
    OutputFormat(PixelFormat),
    ColorAspects(ColorAspects),
}

impl Param {
    pub fn index(&self) -> ParamIndex {
        match self {
            Param::ProfileLevel { .. } => ParamIndex::ProfileLevel,
            Param::Bitrate(_) => ParamIndex::Bitrate,
            Param::BitrateMode(_) => ParamIndex::BitrateMode,
            Param::Framerate(_) => ParamIndex::Framerate,
            Param::IdrPeriod(_) => ParamIndex::IdrPeriod,
            Param::IntraRefresh(_) => ParamIndex::IntraRefresh,
            Param::QpRange(_) => ParamIndex::QpRange,
            Param::DropControl(_) => ParamIndex::DropControl,
            Param::FrameQp(_) => ParamIndex::FrameQp,
            Param::AverageQp(_) => ParamIndex::AverageQp,
            Param::MvHorizontalRange(_) => ParamIndex::MvHorizontalRange,
            Param::MvVerticalRange(_) => ParamIndex::MvVerticalRange,
            Param::TemporalLayering { .. } => ParamIndex::TemporalLayering,
            Param::OperatingRate(_) => ParamIndex::OperatingRate,
            Param::SliceSize(_) => ParamIndex::SliceSize,
            Param::EntropyMode(_) => ParamIndex::EntropyMode,
            Param::MaxIFrameSize(_) => ParamIndex::MaxIFrameSize,
            Param::LowLatency(_) => ParamIndex::LowLatency,
            Param::LtrFrames(_) => ParamIndex::LtrFrames,
            Param::SarSize { .. } => ParamIndex::SarSize,
            Param::BaseLayerPid(_) => ParamIndex::BaseLayerPid,
            Param::InputCrop(_) => ParamIndex::InputCrop,
            Param::OutputPosition(_) => ParamIndex::OutputPosition,
            Param::ScaleSize(_) => ParamIndex::ScaleSize,
            Param::OutputFormat(_) => ParamIndex::OutputFormat,
            Param::ColorAspects(_) => ParamIndex::ColorAspects,
        }
    }
}

/// Identifier of one stage within a pipeline.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FilterId(pub u32);

/// Addressee of a [`FilterParam`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterTarget {
    /// The owning component, i.e. reports surfaced back to the client.
    Component,
    /// A specific stage in the chain.
    Filter(FilterId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterParam {
    pub target: FilterTarget,
    pub param: Param,
}

/// Ordered, append-only bag of [`FilterParam`]s attached to one buffer.
///
/// Each stage drains the entries addressed to it and leaves the rest for the
/// stages (or the component) further along.
#[derive(Clone, Debug, Default)]
pub struct FilterParams(Vec<FilterParam>);

impl FilterParams {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn push(&mut self, param: FilterParam) {
        self.0.push(param);
    }

    pub fn append(&mut self, other: &mut FilterParams) {
        self.0.append(&mut other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Removes and returns the params addressed to `target`, in order.
    pub fn drain_for(&mut self, target: FilterTarget) -> Vec<Param> {
        let mut drained = Vec::new();
        self.0.retain_mut(|entry| {
            if entry.target == target {
                drained.push(entry.param.clone());
                false
            } else {
                true
            }
        });
        drained
    }

    pub fn iter(&self) -> impl Iterator<Item = &FilterParam> {
        self.0.iter()
    }
}
