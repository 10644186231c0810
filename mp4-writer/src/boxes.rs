//! ISO BMFF box serialization.
//!
//! Everything here builds boxes into plain byte vectors; the writer decides
//! where they land in the file. Sizes are always 32-bit: a single fragment
//! never approaches 4 GiB because fragments are cut per keyframe group.

use bytes::{BufMut, Bytes};

/// Movie and media timescale: milliseconds.
pub const TIMESCALE: u32 = 1000;

/// Track ids are fixed: video is always present, audio is optional.
pub const VIDEO_TRACK_ID: u32 = 1;
pub const AUDIO_TRACK_ID: u32 = 2;

/// trun sample flags for a sync sample.
pub const SAMPLE_FLAGS_SYNC: u32 = 0x0200_0000;
/// trun sample flags for a dependent, non-sync sample.
pub const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000;

/// Video codec carried by the track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecTag {
    H264,
    Hevc,
}

impl CodecTag {
    pub fn fourcc(self) -> &'static [u8; 4] {
        match self {
            CodecTag::H264 => b"avc1",
            CodecTag::Hevc => b"hvc1",
        }
    }

    /// Box type of the decoder configuration record.
    fn config_fourcc(self) -> &'static [u8; 4] {
        match self {
            CodecTag::H264 => b"avcC",
            CodecTag::Hevc => b"hvcC",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "h264" | "avc" | "avc1" => Some(CodecTag::H264),
            "h265" | "hevc" | "hvc1" => Some(CodecTag::Hevc),
            _ => None,
        }
    }
}

/// Parameters of the video track.
#[derive(Debug, Clone)]
pub struct TrackParams {
    pub codec: CodecTag,
    pub width: u16,
    pub height: u16,
    pub fps: u32,
    /// Decoder configuration record (e.g. avcC), written verbatim when present.
    pub extradata: Option<Bytes>,
}

impl TrackParams {
    /// Nominal duration of one frame in milliseconds.
    pub fn default_sample_duration(&self) -> u32 {
        (TIMESCALE / self.fps.max(1)).max(1)
    }
}

/// Parameters of the optional audio track.
#[derive(Debug, Clone)]
pub struct AudioParams {
    pub channels: u16,
    pub sample_rate: u32,
    /// Complete `esds` payload from the source probe, written verbatim.
    pub extradata: Option<Bytes>,
}

fn boxed(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.put_u32((8 + payload.len()) as u32);
    buf.put_slice(kind);
    buf.put_slice(payload);
    buf
}

fn full_box(kind: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(4 + payload.len());
    inner.put_u32(((version as u32) << 24) | (flags & 0x00FF_FFFF));
    inner.put_slice(payload);
    boxed(kind, &inner)
}

const UNITY_MATRIX: [u32; 9] = [
    0x0001_0000, 0, 0, //
    0, 0x0001_0000, 0, //
    0, 0, 0x4000_0000,
];

pub fn ftyp() -> Vec<u8> {
    let mut p = Vec::new();
    p.put_slice(b"isom");
    p.put_u32(0x200);
    for brand in [b"isom", b"iso6", b"avc1", b"mp41"] {
        p.put_slice(brand);
    }
    boxed(b"ftyp", &p)
}

fn mvhd(next_track_id: u32) -> Vec<u8> {
    let mut p = Vec::new();
    p.put_u32(0); // creation
    p.put_u32(0); // modification
    p.put_u32(TIMESCALE);
    p.put_u32(0); // duration lives in the fragments
    p.put_u32(0x0001_0000); // rate 1.0
    p.put_u16(0x0100); // volume 1.0
    p.put_u16(0);
    p.put_u64(0);
    for v in UNITY_MATRIX {
        p.put_u32(v);
    }
    for _ in 0..6 {
        p.put_u32(0);
    }
    p.put_u32(next_track_id);
    full_box(b"mvhd", 0, 0, &p)
}

fn tkhd(track_id: u32, width: u16, height: u16, audio: bool) -> Vec<u8> {
    let mut p = Vec::new();
    p.put_u32(0); // creation
    p.put_u32(0); // modification
    p.put_u32(track_id);
    p.put_u32(0);
    p.put_u32(0); // duration
    p.put_u64(0);
    p.put_u16(0); // layer
    p.put_u16(0); // alternate group
    p.put_u16(if audio { 0x0100 } else { 0 }); // volume
    p.put_u16(0);
    for v in UNITY_MATRIX {
        p.put_u32(v);
    }
    p.put_u32((width as u32) << 16);
    p.put_u32((height as u32) << 16);
    full_box(b"tkhd", 0, 0x3, &p) // enabled + in movie
}

fn mdhd() -> Vec<u8> {
    let mut p = Vec::new();
    p.put_u32(0);
    p.put_u32(0);
    p.put_u32(TIMESCALE);
    p.put_u32(0);
    p.put_u16(0x55C4); // "und"
    p.put_u16(0);
    full_box(b"mdhd", 0, 0, &p)
}

fn hdlr(handler: &[u8; 4], name: &str) -> Vec<u8> {
    let mut p = Vec::new();
    p.put_u32(0);
    p.put_slice(handler);
    for _ in 0..3 {
        p.put_u32(0);
    }
    p.put_slice(name.as_bytes());
    p.put_u8(0);
    full_box(b"hdlr", 0, 0, &p)
}

fn dinf() -> Vec<u8> {
    let url = full_box(b"url ", 0, 1, &[]); // data lives in this file
    let mut dref_payload = Vec::new();
    dref_payload.put_u32(1);
    dref_payload.put_slice(&url);
    let dref = full_box(b"dref", 0, 0, &dref_payload);
    boxed(b"dinf", &dref)
}

fn visual_sample_entry(params: &TrackParams) -> Vec<u8> {
    let mut p = Vec::new();
    p.put_slice(&[0u8; 6]);
    p.put_u16(1); // data reference index
    p.put_u16(0);
    p.put_u16(0);
    for _ in 0..3 {
        p.put_u32(0);
    }
    p.put_u16(params.width);
    p.put_u16(params.height);
    p.put_u32(0x0048_0000); // 72 dpi
    p.put_u32(0x0048_0000);
    p.put_u32(0);
    p.put_u16(1); // frame count
    p.put_slice(&[0u8; 32]); // compressor name
    p.put_u16(0x0018); // depth
    p.put_u16(0xFFFF);
    if let Some(ref extradata) = params.extradata {
        p.put_slice(&boxed(params.codec.config_fourcc(), extradata));
    }
    boxed(params.codec.fourcc(), &p)
}

fn audio_sample_entry(params: &AudioParams) -> Vec<u8> {
    let mut p = Vec::new();
    p.put_slice(&[0u8; 6]);
    p.put_u16(1); // data reference index
    p.put_u64(0);
    p.put_u16(params.channels);
    p.put_u16(16); // sample size
    p.put_u16(0);
    p.put_u16(0);
    p.put_u32(params.sample_rate << 16);
    if let Some(ref extradata) = params.extradata {
        p.put_slice(&full_box(b"esds", 0, 0, extradata));
    }
    boxed(b"mp4a", &p)
}

fn empty_stbl(sample_entry: &[u8]) -> Vec<u8> {
    let mut stsd_payload = Vec::new();
    stsd_payload.put_u32(1);
    stsd_payload.put_slice(sample_entry);
    let stsd = full_box(b"stsd", 0, 0, &stsd_payload);

    let mut zero_entries = Vec::new();
    zero_entries.put_u32(0);
    let stts = full_box(b"stts", 0, 0, &zero_entries);
    let stsc = full_box(b"stsc", 0, 0, &zero_entries);
    let stco = full_box(b"stco", 0, 0, &zero_entries);

    let mut stsz_payload = Vec::new();
    stsz_payload.put_u32(0);
    stsz_payload.put_u32(0);
    let stsz = full_box(b"stsz", 0, 0, &stsz_payload);

    let mut p = Vec::new();
    p.put_slice(&stsd);
    p.put_slice(&stts);
    p.put_slice(&stsc);
    p.put_slice(&stsz);
    p.put_slice(&stco);
    boxed(b"stbl", &p)
}

fn trak(track_id: u32, header: &[u8], media_header: &[u8], handler: &[u8], stbl: &[u8]) -> Vec<u8> {
    let _ = track_id;
    let mut minf = Vec::new();
    minf.put_slice(media_header);
    minf.put_slice(&dinf());
    minf.put_slice(stbl);
    let minf = boxed(b"minf", &minf);

    let mut mdia = Vec::new();
    mdia.put_slice(&mdhd());
    mdia.put_slice(handler);
    mdia.put_slice(&minf);
    let mdia = boxed(b"mdia", &mdia);

    let mut p = Vec::new();
    p.put_slice(header);
    p.put_slice(&mdia);
    boxed(b"trak", &p)
}

fn trex(track_id: u32) -> Vec<u8> {
    let mut p = Vec::new();
    p.put_u32(track_id);
    p.put_u32(1); // sample description index
    p.put_u32(0);
    p.put_u32(0);
    p.put_u32(0);
    full_box(b"trex", 0, 0, &p)
}

/// The movie header (init segment minus ftyp): empty sample tables plus
/// `mvex`, so all sample data lives in the fragments that follow.
pub fn moov(video: &TrackParams, audio: Option<&AudioParams>) -> Vec<u8> {
    let mut vmhd_payload = Vec::new();
    vmhd_payload.put_u16(0);
    for _ in 0..3 {
        vmhd_payload.put_u16(0);
    }
    let vmhd = full_box(b"vmhd", 0, 1, &vmhd_payload);

    let video_trak = trak(
        VIDEO_TRACK_ID,
        &tkhd(VIDEO_TRACK_ID, video.width, video.height, false),
        &vmhd,
        &hdlr(b"vide", "VideoHandler"),
        &empty_stbl(&visual_sample_entry(video)),
    );

    let mut mvex_payload = Vec::new();
    mvex_payload.put_slice(&trex(VIDEO_TRACK_ID));

    let mut p = Vec::new();
    let next_track_id = if audio.is_some() { 3 } else { 2 };
    p.put_slice(&mvhd(next_track_id));
    p.put_slice(&video_trak);

    if let Some(audio) = audio {
        let mut smhd_payload = Vec::new();
        smhd_payload.put_u16(0);
        smhd_payload.put_u16(0);
        let smhd = full_box(b"smhd", 0, 0, &smhd_payload);

        let audio_trak = trak(
            AUDIO_TRACK_ID,
            &tkhd(AUDIO_TRACK_ID, 0, 0, true),
            &smhd,
            &hdlr(b"soun", "SoundHandler"),
            &empty_stbl(&audio_sample_entry(audio)),
        );
        p.put_slice(&audio_trak);
        mvex_payload.put_slice(&trex(AUDIO_TRACK_ID));
    }

    p.put_slice(&boxed(b"mvex", &mvex_payload));
    boxed(b"moov", &p)
}

/// One sample in a fragment run.
#[derive(Debug, Clone)]
pub struct RunSample {
    pub duration_ms: u32,
    pub size: u32,
    pub is_sync: bool,
}

/// One track's run within a fragment.
#[derive(Debug, Clone)]
pub struct TrackRun {
    pub track_id: u32,
    /// Media decode time of the first sample, in milliseconds.
    pub base_time_ms: u64,
    pub samples: Vec<RunSample>,
}

impl TrackRun {
    fn traf_size(&self) -> usize {
        // tfhd(16) + tfdt(20) + trun(20 + 12 per sample) inside a traf header.
        8 + 16 + 20 + 20 + 12 * self.samples.len()
    }

    fn data_size(&self) -> u64 {
        self.samples.iter().map(|s| s.size as u64).sum()
    }

    fn traf(&self, data_offset: i32) -> Vec<u8> {
        let mut tfhd_payload = Vec::new();
        tfhd_payload.put_u32(self.track_id);
        let tfhd = full_box(b"tfhd", 0, 0x020000, &tfhd_payload); // base is moof

        let mut tfdt_payload = Vec::new();
        tfdt_payload.put_u64(self.base_time_ms);
        let tfdt = full_box(b"tfdt", 1, 0, &tfdt_payload);

        let mut trun_payload = Vec::new();
        trun_payload.put_u32(self.samples.len() as u32);
        trun_payload.put_i32(data_offset);
        for sample in &self.samples {
            trun_payload.put_u32(sample.duration_ms);
            trun_payload.put_u32(sample.size);
            trun_payload.put_u32(if sample.is_sync {
                SAMPLE_FLAGS_SYNC
            } else {
                SAMPLE_FLAGS_NON_SYNC
            });
        }
        // data offset + duration + size + flags present
        let trun = full_box(b"trun", 0, 0x000701, &trun_payload);

        let mut p = Vec::new();
        p.put_slice(&tfhd);
        p.put_slice(&tfdt);
        p.put_slice(&trun);
        boxed(b"traf", &p)
    }
}

/// Serialized `moof` for the given runs, plus the matching `mdat` header.
/// Sample payloads must follow in run order, video before audio.
pub fn moof(sequence: u32, runs: &[TrackRun]) -> (Vec<u8>, u64) {
    let mut mfhd_payload = Vec::new();
    mfhd_payload.put_u32(sequence);
    let mfhd = full_box(b"mfhd", 0, 0, &mfhd_payload);

    let moof_size = 8 + mfhd.len() + runs.iter().map(|r| r.traf_size()).sum::<usize>();

    let mut p = Vec::new();
    p.put_slice(&mfhd);
    let mut data_offset = (moof_size + 8) as i64; // past the mdat header
    for run in runs {
        p.put_slice(&run.traf(data_offset as i32));
        data_offset += run.data_size() as i64;
    }
    let moof = boxed(b"moof", &p);
    debug_assert_eq!(moof.len(), moof_size);

    let mdat_payload: u64 = runs.iter().map(|r| r.data_size()).sum();
    (moof, mdat_payload)
}

pub fn mdat_header(payload_len: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.put_u32((8 + payload_len) as u32);
    buf.put_slice(b"mdat");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn box_kind(buf: &[u8]) -> &[u8] {
        &buf[4..8]
    }

    #[test]
    fn test_ftyp_shape() {
        let b = ftyp();
        assert_eq!(box_kind(&b), b"ftyp");
        assert_eq!(u32::from_be_bytes(b[0..4].try_into().unwrap()) as usize, b.len());
        assert_eq!(&b[8..12], b"isom");
    }

    #[test]
    fn test_moov_video_only() {
        let params = TrackParams {
            codec: CodecTag::H264,
            width: 1280,
            height: 720,
            fps: 30,
            extradata: None,
        };
        let b = moov(&params, None);
        assert_eq!(box_kind(&b), b"moov");
        assert_eq!(u32::from_be_bytes(b[0..4].try_into().unwrap()) as usize, b.len());
        // one trak, no audio
        let hits = b.windows(4).filter(|w| *w == b"trak").count();
        assert_eq!(hits, 1);
        assert!(b.windows(4).any(|w| w == b"mvex"));
        assert!(b.windows(4).any(|w| w == b"avc1"));
    }

    #[test]
    fn test_moov_with_audio() {
        let params = TrackParams {
            codec: CodecTag::Hevc,
            width: 1920,
            height: 1080,
            fps: 25,
            extradata: None,
        };
        let audio = AudioParams {
            channels: 2,
            sample_rate: 48_000,
            extradata: None,
        };
        let b = moov(&params, Some(&audio));
        assert_eq!(b.windows(4).filter(|w| *w == b"trak").count(), 2);
        assert!(b.windows(4).any(|w| w == b"hvc1"));
        assert!(b.windows(4).any(|w| w == b"mp4a"));
    }

    #[test]
    fn test_moof_data_offsets() {
        let runs = vec![
            TrackRun {
                track_id: VIDEO_TRACK_ID,
                base_time_ms: 0,
                samples: vec![
                    RunSample { duration_ms: 33, size: 100, is_sync: true },
                    RunSample { duration_ms: 33, size: 50, is_sync: false },
                ],
            },
            TrackRun {
                track_id: AUDIO_TRACK_ID,
                base_time_ms: 0,
                samples: vec![RunSample { duration_ms: 21, size: 30, is_sync: true }],
            },
        ];
        let (moof_buf, mdat_len) = moof(7, &runs);
        assert_eq!(box_kind(&moof_buf), b"moof");
        assert_eq!(mdat_len, 180);

        // first trun's data offset lands immediately after the mdat header
        let trun_pos = moof_buf
            .windows(4)
            .position(|w| w == b"trun")
            .unwrap();
        let offset_pos = trun_pos + 4 + 4 + 4; // kind, version/flags, sample count
        let data_offset =
            i32::from_be_bytes(moof_buf[offset_pos..offset_pos + 4].try_into().unwrap());
        assert_eq!(data_offset as usize, moof_buf.len() + 8);
    }

    #[test]
    fn test_default_sample_duration() {
        let params = TrackParams {
            codec: CodecTag::H264,
            width: 640,
            height: 480,
            fps: 10,
            extradata: None,
        };
        assert_eq!(params.default_sample_duration(), 100);
    }
}
