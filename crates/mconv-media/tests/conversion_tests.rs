//! Conversion integration tests against stand-in executables.

mod common;

use std::time::Duration;

use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use mconv_media::{
    check_ffmpeg, check_ffprobe, Conversion, ConversionEvent, ConversionPhase, ConversionSettings, InputSource, MediaError,
};
use serde_json::json;
use tokio::time::timeout;

use common::{arguments, byte_stream, contains_pair, drain, settings, TIMEOUT};

const PAYLOAD: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn total(chunks: &[Bytes]) -> Vec<u8> {
    chunks.iter().flat_map(|chunk| chunk.iter().copied()).collect()
}

#[tokio::test]
async fn test_stream_to_stream() {
    let work = tempfile::tempdir().unwrap();
    let conversion = Conversion::with_settings(settings(work.path()));
    let mut events = conversion.subscribe();

    let input = conversion
        .add_input(InputSource::stream(byte_stream(PAYLOAD, 5)))
        .unwrap();
    input.set("format", "mpegts").unwrap();
    input.set("video_codec", "h264").unwrap();

    let output = conversion.add_output().unwrap();
    output.set("format", "mpegts").unwrap();
    let stream = output.take_stream().unwrap();

    conversion.start().await.unwrap();
    let collected: Vec<Bytes> = timeout(TIMEOUT, stream.try_collect()).await.unwrap().unwrap();
    timeout(TIMEOUT, conversion.wait()).await.unwrap().unwrap();

    assert_eq!(total(&collected), PAYLOAD);
    assert_eq!(conversion.phase(), ConversionPhase::Ended);

    let events = drain(&mut events);
    assert_eq!(
        arguments(&events),
        vec![
            "-hide_banner", "-y", "-f", "mpegts", "-c:v", "h264", "-i", "pipe:0", "-strict", "-2", "-f",
            "mpegts", "pipe:1",
        ]
    );

    let ends: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            ConversionEvent::End(err) => Some(err.is_none()),
            _ => None,
        })
        .collect();
    assert_eq!(ends, vec![true]);

    assert!(events.iter().any(|e| matches!(e, ConversionEvent::Start { pid: Some(_) })));
    assert!(events.iter().any(|e| matches!(e, ConversionEvent::Progress(p) if p.frame == 2)));
    assert!(events.iter().any(
        |e| matches!(e, ConversionEvent::InputCodec(codec) if codec == "Stream #0:0[0x100]: Video: h264")
    ));
    assert!(!events.iter().any(|e| matches!(e, ConversionEvent::Error(_))));
}

#[tokio::test]
async fn test_extra_pipes() {
    let work = tempfile::tempdir().unwrap();
    let conversion = Conversion::with_settings(settings(work.path()));
    let mut events = conversion.subscribe();

    let first = conversion.add_input(InputSource::stream(byte_stream(b"first|", 2))).unwrap();
    let second = conversion.add_input(InputSource::stream(byte_stream(b"second", 4))).unwrap();
    for input in [&first, &second] {
        input.set("video_codec", "h264").unwrap();
    }

    let main = conversion.add_output().unwrap();
    let side = conversion.add_output().unwrap();
    let main_stream = main.take_stream().unwrap();
    let side_stream = side.take_stream().unwrap();

    conversion.start().await.unwrap();

    assert_eq!(first.pipe_number(), Some(0));
    assert_eq!(second.pipe_number(), Some(3));
    assert_eq!(main.pipe_number(), Some(1));
    assert_eq!(side.pipe_number(), Some(4));

    let (main_chunks, side_chunks) = timeout(
        TIMEOUT,
        futures::future::try_join(
            main_stream.try_collect::<Vec<Bytes>>(),
            side_stream.try_collect::<Vec<Bytes>>(),
        ),
    )
    .await
    .unwrap()
    .unwrap();
    timeout(TIMEOUT, conversion.wait()).await.unwrap().unwrap();

    assert_eq!(total(&main_chunks), b"first|second");
    assert_eq!(total(&side_chunks), b"side");

    let args = arguments(&drain(&mut events));
    assert!(contains_pair(&args, "-i", "pipe:0"));
    assert!(contains_pair(&args, "-i", "pipe:3"));
    assert_eq!(args.last().map(String::as_str), Some("pipe:4"));
}

#[tokio::test]
async fn test_nonzero_exit() {
    let work = tempfile::tempdir().unwrap();
    let target = work.path().join("nested").join("clip.ts");

    let conversion = Conversion::with_settings(settings(work.path()));
    let mut events = conversion.subscribe();

    let input = conversion.add_input("/media/clip.mp4").unwrap();
    input.set("video_codec", "h264").unwrap();
    let output = conversion.add_output_to(&target).unwrap();
    output.set("format", "fail_exit").unwrap();

    let err = timeout(TIMEOUT, conversion.run()).await.unwrap().unwrap_err();
    match &err {
        MediaError::FfmpegFailed { message, exit_code, .. } => {
            assert_eq!(*exit_code, Some(1));
            assert_eq!(message, "FFmpeg exited with code 1: Unrecognized option 'bogus'.");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert!(target.parent().unwrap().is_dir());
    assert!(work.path().join("mc-tmp").is_dir());

    let events = drain(&mut events);
    assert_eq!(events.iter().filter(|e| matches!(e, ConversionEvent::End(Some(_)))).count(), 1);
    assert_eq!(events.iter().filter(|e| matches!(e, ConversionEvent::Error(_))).count(), 1);
    assert!(events
        .iter()
        .any(|e| matches!(e, ConversionEvent::ConversionError(line) if line.starts_with("Unrecognized"))));
}

#[tokio::test]
async fn test_fatal_diagnostic() {
    let work = tempfile::tempdir().unwrap();
    let conversion = Conversion::with_settings(settings(work.path()));

    let input = conversion.add_input("/media/clip.mp4").unwrap();
    input.set("video_codec", "h264").unwrap();
    let output = conversion.add_output().unwrap();
    output.set("format", "fail_fatal").unwrap();
    let mut stream = output.take_stream().unwrap();

    let err = timeout(TIMEOUT, conversion.run()).await.unwrap().unwrap_err();
    assert_eq!(
        err.to_string(),
        "Conversion failed: Error while opening encoder for output stream #0:0"
    );

    // The stream consumer sees the failure as well
    let item = timeout(TIMEOUT, stream.next()).await.unwrap();
    assert!(matches!(item, Some(Err(_))));
}

#[tokio::test]
async fn test_copy_detection() {
    let work = tempfile::tempdir().unwrap();
    let conversion = Conversion::with_settings(settings(work.path()));
    let mut events = conversion.subscribe();

    conversion
        .add_input(InputSource::stream(byte_stream(PAYLOAD, 8)))
        .unwrap();

    let copied = conversion.add_output().unwrap();
    copied.set("video_codec", "h264").unwrap();
    let stream = copied.take_stream().unwrap();

    let filtered = conversion.add_output_to(work.path().join("small.ts")).unwrap();
    filtered.set("video_codec", "h264").unwrap();
    filtered.set_filter("scale", "320:-1");

    conversion.start().await.unwrap();
    let collected: Vec<Bytes> = timeout(TIMEOUT, stream.try_collect()).await.unwrap().unwrap();
    timeout(TIMEOUT, conversion.wait()).await.unwrap().unwrap();

    assert_eq!(total(&collected), PAYLOAD);
    assert_eq!(copied.allow_video_copy(), Some(true));
    assert_eq!(filtered.allow_video_copy(), Some(false));

    let events = drain(&mut events);
    let args = arguments(&events);
    assert!(contains_pair(&args, "-c:v", "copy"));
    assert!(contains_pair(&args, "-c:v", "h264"));
    assert!(contains_pair(&args, "-vf", "scale=320:-1"));
    assert!(events
        .iter()
        .any(|e| matches!(e, ConversionEvent::Probed { input: 0, .. })));
}

#[tokio::test]
async fn test_raw_frames() {
    let work = tempfile::tempdir().unwrap();
    let conversion = Conversion::with_settings(settings(work.path()));
    let mut events = conversion.subscribe();

    // 4x2 rgb24 frames are 24 bytes, the last two bytes are an incomplete frame
    static FRAMES: [u8; 50] = [7; 50];
    conversion
        .add_input(InputSource::stream(byte_stream(&FRAMES, 7)))
        .unwrap();

    let output = conversion.raw_frames_output(None).unwrap();
    let stream = output.take_stream().unwrap();

    conversion.start().await.unwrap();
    let frames: Vec<Bytes> = timeout(TIMEOUT, stream.try_collect()).await.unwrap().unwrap();
    timeout(TIMEOUT, conversion.wait()).await.unwrap().unwrap();

    assert_eq!(frames.iter().map(Bytes::len).collect::<Vec<_>>(), vec![24, 24]);
    assert_eq!(output.frame_info().map(|info| info.chunk_size), Some(24));
    assert_eq!(
        output.probe_value("chunk_size").await.unwrap(),
        Some(json!({ "chunk_size": 24, "width": 4, "height": 2, "depth": 3 }))
    );

    let args = arguments(&drain(&mut events));
    assert!(contains_pair(&args, "-pix_fmt", "rgb24"));
    assert!(contains_pair(&args, "-video_size", "4x2"));
    assert!(contains_pair(&args, "-r", "25"));
}

#[tokio::test]
async fn test_chained_conversions() {
    let work = tempfile::tempdir().unwrap();

    let first = Conversion::with_settings(settings(work.path()));
    let input = first
        .add_input(InputSource::stream(byte_stream(PAYLOAD, 6)))
        .unwrap();
    input.set("video_codec", "h264").unwrap();
    let intermediate = first.add_output().unwrap();

    let second = Conversion::with_settings(settings(work.path()));
    let chained = second.add_input(intermediate.clone()).unwrap();
    let output = second.add_output().unwrap();
    let stream = output.take_stream().unwrap();

    assert!(matches!(intermediate.take_stream(), Err(MediaError::StreamTaken)));
    assert_eq!(
        chained.probe_value("video_codec").await.unwrap(),
        Some(json!("h264"))
    );

    first.start().await.unwrap();
    second.start().await.unwrap();

    let collected: Vec<Bytes> = timeout(TIMEOUT, stream.try_collect()).await.unwrap().unwrap();
    timeout(TIMEOUT, first.wait()).await.unwrap().unwrap();
    timeout(TIMEOUT, second.wait()).await.unwrap().unwrap();

    assert_eq!(total(&collected), PAYLOAD);
}

#[tokio::test]
async fn test_cancel_running_conversion() {
    let work = tempfile::tempdir().unwrap();
    let conversion = Conversion::with_settings(settings(work.path()));
    let mut events = conversion.subscribe();

    let endless = stream::iter([Ok::<_, std::io::Error>(Bytes::from_static(b"start"))]).chain(stream::pending());
    let input = conversion.add_input(InputSource::stream(endless)).unwrap();
    input.set("video_codec", "h264").unwrap();
    let output = conversion.add_output().unwrap();
    let mut stream = output.take_stream().unwrap();

    conversion.start().await.unwrap();
    assert_eq!(conversion.phase(), ConversionPhase::Running);

    let first = timeout(TIMEOUT, stream.next()).await.unwrap();
    assert_eq!(first.unwrap().unwrap(), Bytes::from_static(b"start"));

    conversion.cancel();
    conversion.stop();

    assert!(matches!(
        timeout(TIMEOUT, conversion.wait()).await.unwrap(),
        Err(MediaError::Cancelled)
    ));

    // The stream consumer sees the cancellation, then the end
    assert!(matches!(timeout(TIMEOUT, stream.next()).await.unwrap(), Some(Err(_))));
    assert!(timeout(TIMEOUT, stream.next()).await.unwrap().is_none());

    let ends = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, ConversionEvent::End(Some(MediaError::Cancelled))))
        .count();
    assert_eq!(ends, 1);
}

#[tokio::test]
async fn test_stop_while_probing() {
    let work = tempfile::tempdir().unwrap();
    let conversion = Conversion::with_settings(settings(work.path()));

    // No declared codec, so readiness waits on an analyzer that never sees EOF
    let endless = stream::iter([Ok::<_, std::io::Error>(Bytes::from_static(b"x"))]).chain(stream::pending());
    let input = conversion.add_input(InputSource::stream(endless)).unwrap();
    let output = conversion.add_output().unwrap();
    let _stream = output.take_stream().unwrap();

    let starting = tokio::spawn({
        let conversion = conversion.clone();
        async move { conversion.start().await }
    });

    let probe = timeout(TIMEOUT, input.probe()).await.unwrap().unwrap();
    timeout(TIMEOUT, async {
        while conversion.phase() != ConversionPhase::Assembling {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(!probe.is_finished());

    conversion.stop();

    let started = timeout(TIMEOUT, starting).await.unwrap().unwrap();
    assert!(matches!(started, Err(MediaError::Cancelled)));
    assert!(timeout(TIMEOUT, conversion.wait()).await.unwrap().is_ok());
    assert!(matches!(
        timeout(TIMEOUT, probe.result()).await.unwrap(),
        Err(MediaError::Cancelled)
    ));
    assert_eq!(conversion.pid(), None);
    assert!(matches!(input.reprobe().await, Err(MediaError::Cancelled)));
}

#[tokio::test]
async fn test_niceness_is_absolute() {
    let work = tempfile::tempdir().unwrap();
    let conversion = Conversion::with_settings(settings(work.path()).with_niceness(Some(18)));

    let endless = stream::iter([Ok::<_, std::io::Error>(Bytes::from_static(b"x"))]).chain(stream::pending());
    let input = conversion.add_input(InputSource::stream(endless)).unwrap();
    input.set("video_codec", "h264").unwrap();
    conversion.add_output_to(work.path().join("out.ts")).unwrap();

    conversion.start().await.unwrap();
    let pid = conversion.pid().unwrap();
    let niceness = || unsafe { libc::getpriority(libc::PRIO_PROCESS, pid as libc::id_t) };
    assert_eq!(niceness(), 18);

    conversion.renice(19).unwrap();
    assert_eq!(niceness(), 19);
    conversion.renice(19).unwrap();

    conversion.cancel();
    assert!(matches!(
        timeout(TIMEOUT, conversion.wait()).await.unwrap(),
        Err(MediaError::Cancelled)
    ));
}

#[tokio::test]
async fn test_set_many_rejects_unknown_keys() {
    let work = tempfile::tempdir().unwrap();
    let conversion = Conversion::with_settings(settings(work.path()));
    let output = conversion.add_output().unwrap();

    output
        .set_many([
            ("video_codec", json!("libx264")),
            ("-an", json!(true)),
            ("arguments", json!(["-g", 50])),
        ])
        .unwrap();

    let err = output.set_many([("teleport", json!(1))]).unwrap_err();
    assert!(matches!(err, MediaError::UnknownOption { endpoint: "output", .. }));

    assert_eq!(
        output.argument_tokens().await.unwrap(),
        vec!["-strict", "-2", "-c:v", "libx264", "-an", "-g", "50"]
    );
}

#[tokio::test]
#[ignore = "requires ffmpeg and ffprobe on PATH"]
async fn test_real_transcoder_raw_frames() {
    let work = tempfile::tempdir().unwrap();
    let clip = work.path().join("clip.ts");

    let status = tokio::process::Command::new("ffmpeg")
        .args(["-hide_banner", "-loglevel", "error", "-f", "lavfi", "-i"])
        .arg("testsrc=size=32x24:rate=5:duration=1")
        .args(["-c:v", "mpeg1video", "-f", "mpegts"])
        .arg(&clip)
        .status()
        .await
        .unwrap();
    assert!(status.success());

    let settings = ConversionSettings::default().with_work_dir(work.path());
    check_ffmpeg(&settings).unwrap();
    check_ffprobe(&settings).unwrap();

    let conversion = Conversion::with_settings(settings);
    conversion.add_input(clip.as_path()).unwrap();
    let output = conversion.raw_frames_output(Some("gray")).unwrap();
    let stream = output.take_stream().unwrap();

    conversion.start().await.unwrap();
    let frames: Vec<Bytes> = timeout(TIMEOUT, stream.try_collect()).await.unwrap().unwrap();
    timeout(TIMEOUT, conversion.wait()).await.unwrap().unwrap();

    assert!(!frames.is_empty());
    assert!(frames.iter().all(|frame| frame.len() == 32 * 24));
}
