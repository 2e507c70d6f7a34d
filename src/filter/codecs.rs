// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-bitstream-format capability data for the encoder filter.
//!
//! A capability fixes which configuration indices a format recognizes and
//! whether the session is secure; the encoder filter's control flow is
//! identical for every format.

use std::collections::BTreeSet;

use crate::params::ParamIndex;
use crate::CodedFormat;

#[derive(Clone, Debug)]
pub struct CodecCapability {
    pub coded: CodedFormat,
    pub recognized: BTreeSet<ParamIndex>,
    pub secure: bool,
}

fn base_set() -> BTreeSet<ParamIndex> {
    BTreeSet::from([
        ParamIndex::ProfileLevel,
        ParamIndex::Bitrate,
        ParamIndex::BitrateMode,
        ParamIndex::Framerate,
        ParamIndex::IdrPeriod,
        ParamIndex::IntraRefresh,
        ParamIndex::QpRange,
        ParamIndex::DropControl,
        ParamIndex::FrameQp,
        ParamIndex::AverageQp,
        ParamIndex::MvHorizontalRange,
        ParamIndex::MvVerticalRange,
        ParamIndex::OperatingRate,
    ])
}

impl CodecCapability {
    pub fn h264(secure: bool) -> Self {
        let mut recognized = base_set();
        recognized.extend([
            ParamIndex::TemporalLayering,
            ParamIndex::SliceSize,
            ParamIndex::EntropyMode,
            ParamIndex::MaxIFrameSize,
            ParamIndex::LowLatency,
            ParamIndex::LtrFrames,
            ParamIndex::SarSize,
            ParamIndex::BaseLayerPid,
        ]);
        Self { coded: CodedFormat::H264, recognized, secure }
    }

    pub fn h263(secure: bool) -> Self {
        let mut recognized = base_set();
        // H.263 has no intra-refresh or per-frame QP control.
        recognized.remove(&ParamIndex::IntraRefresh);
        recognized.remove(&ParamIndex::FrameQp);
        Self { coded: CodedFormat::H263, recognized, secure }
    }

    pub fn mpeg4(secure: bool) -> Self {
        Self { coded: CodedFormat::Mpeg4, recognized: base_set(), secure }
    }

    pub fn vp8(secure: bool) -> Self {
        let mut recognized = base_set();
        recognized.insert(ParamIndex::TemporalLayering);
        Self { coded: CodedFormat::VP8, recognized, secure }
    }

    pub fn vp9(secure: bool) -> Self {
        let mut recognized = base_set();
        recognized.extend([ParamIndex::TemporalLayering, ParamIndex::LowLatency]);
        Self { coded: CodedFormat::VP9, recognized, secure }
    }

    pub fn for_format(coded: CodedFormat, secure: bool) -> Self {
        match coded {
            CodedFormat::H264 => Self::h264(secure),
            CodedFormat::H263 => Self::h263(secure),
            CodedFormat::Mpeg4 => Self::mpeg4(secure),
            CodedFormat::VP8 => Self::vp8(secure),
            CodedFormat::VP9 => Self::vp9(secure),
        }
    }

    pub fn recognizes(&self, index: ParamIndex) -> bool {
        self.recognized.contains(&index)
    }
}
