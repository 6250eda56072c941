use httpmock::prelude::*;
use kiana_bot::{
    plugins::{
        anime_trace::AnimeTraceClient,
        character_trace::CharacterTraceClient,
        image::TraceError,
        resolver::{
            ResolveError,
            bilibili::{BilibiliClient, VideoId, VideoStream},
        },
    },
    settings::{AnimeTraceSettings, CharacterTraceSettings, ResolverSettings},
};
use serde_json::json;

const BVID: &str = "BV1GJ411x7h7";

fn bilibili(server: &MockServer, settings: ResolverSettings) -> BilibiliClient {
    BilibiliClient::new(
        reqwest::Client::new(),
        ResolverSettings {
            bilibili_view_api: server.url("/x/web-interface/view"),
            bilibili_playurl_api: server.url("/x/player/playurl"),
            ..settings
        },
    )
}

#[tokio::test]
async fn bilibili_stream_goes_through_view_then_playurl() {
    let server = MockServer::start_async().await;
    let view = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/x/web-interface/view")
                .query_param("aid", "170001")
                .header_exists("referer");
            then.status(200).json_body(json!({
                "code": 0,
                "data": {"bvid": BVID, "cid": 279786, "duration": 212, "title": "试听"}
            }));
        })
        .await;
    let playurl = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/x/player/playurl")
                .query_param("bvid", BVID)
                .query_param("cid", "279786")
                .query_param("qn", "64");
            then.status(200).json_body(json!({
                "code": 0,
                "data": {"durl": [{"url": "https://upos.example/video.mp4", "size": 2048}]}
            }));
        })
        .await;

    let client = bilibili(&server, ResolverSettings::default());
    let stream = client.video_stream(&VideoId::Av(170001)).await.unwrap();

    view.assert_async().await;
    playurl.assert_async().await;
    assert_eq!(
        stream,
        VideoStream {
            bvid: BVID.to_owned(),
            url: "https://upos.example/video.mp4".to_owned(),
            size: 2048,
        }
    );
}

#[tokio::test]
async fn bilibili_refuses_long_and_large_videos() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/x/web-interface/view").query_param("bvid", BVID);
            then.status(200).json_body(json!({
                "code": 0,
                "data": {"bvid": BVID, "cid": 1, "duration": 3600}
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/x/player/playurl");
            then.status(200).json_body(json!({
                "code": 0,
                "data": {"durl": [{"url": "https://upos.example/big.mp4", "size": 5 * 1024 * 1024}]}
            }));
        })
        .await;

    let id = VideoId::Bv(BVID.to_owned());

    let strict_duration = bilibili(&server, ResolverSettings::default());
    match strict_duration.video_stream(&id).await {
        Err(ResolveError::Refused(reason)) => assert_eq!(reason, "视频时长超过10.0分钟，无法下载"),
        other => panic!("unexpected {other:?}"),
    }

    let strict_size = bilibili(
        &server,
        ResolverSettings {
            max_video_duration_secs: 7200,
            max_video_size_bytes: 1024 * 1024,
            ..Default::default()
        },
    );
    match strict_size.video_stream(&id).await {
        Err(ResolveError::Refused(reason)) => assert_eq!(reason, "视频大小超过1.0MB，无法下载"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn bilibili_api_errors_are_explained() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/x/web-interface/view");
            then.status(200).json_body(json!({"code": -404, "message": "啥都木有"}));
        })
        .await;

    let client = bilibili(&server, ResolverSettings::default());
    match client.video_info(&VideoId::Bv(BVID.to_owned())).await {
        Err(ResolveError::Refused(reason)) => assert_eq!(reason, "获取视频信息失败：啥都木有"),
        other => panic!("unexpected {other:?}"),
    }
}

async fn mock_image(server: &MockServer) {
    server
        .mock_async(|when, then| {
            when.method(GET).path("/image.png");
            then.status(200)
                .header("content-type", "image/png")
                .body("not-really-a-png");
        })
        .await;
}

#[tokio::test]
async fn anime_trace_uploads_the_image_and_formats_the_best_match() {
    let server = MockServer::start_async().await;
    mock_image(&server).await;
    let search = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/search")
                .header("user-agent", "okhttp/4.9.3")
                .body_contains("image.png");
            then.status(200).json_body(json!({
                "error": "",
                "result": [{
                    "anilist": {"isAdult": false, "synonyms": ["孤独摇滚！"], "title": {"native": "ぼっち・ざ・ろっく！"}},
                    "episode": 8,
                    "from": 622.4,
                    "similarity": 0.9731,
                    "video": "https://media.trace.moe/video/clip.mp4"
                }]
            }));
        })
        .await;

    let client = AnimeTraceClient::new(
        reqwest::Client::new(),
        AnimeTraceSettings {
            api_url: server.url("/search"),
            timeout_secs: 5,
        },
    );
    let reply = client.trace(&server.url("/image.png")).await.unwrap();

    search.assert_async().await;
    assert_eq!(
        reply.text,
        "识别结果：\n番名：孤独摇滚！\n第 8 集 10 分 22 秒\n置信度：97.31%"
    );
    assert_eq!(reply.video_url.as_deref(), Some("https://media.trace.moe/video/clip.mp4"));
}

#[tokio::test]
async fn anime_trace_reports_each_failure_kind() {
    let server = MockServer::start_async().await;
    mock_image(&server).await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/missing.png");
            then.status(404);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/down");
            then.status(502);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/empty");
            then.status(200).json_body(json!({"error": "", "result": []}));
        })
        .await;

    let client = |path: &str| {
        AnimeTraceClient::new(
            reqwest::Client::new(),
            AnimeTraceSettings {
                api_url: server.url(path),
                timeout_secs: 5,
            },
        )
    };

    assert!(matches!(
        client("/empty").trace(&server.url("/missing.png")).await,
        Err(TraceError::Download(_))
    ));
    assert!(matches!(
        client("/down").trace(&server.url("/image.png")).await,
        Err(TraceError::Status(502))
    ));
    assert!(matches!(
        client("/empty").trace(&server.url("/image.png")).await,
        Err(TraceError::NoResult)
    ));
}

#[tokio::test]
async fn character_trace_sends_the_model_and_reads_the_code() {
    let server = MockServer::start_async().await;
    mock_image(&server).await;
    let detect = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/detect")
                .body_contains("game_model_kirakira");
            then.status(200).json_body(json!({
                "new_code": 17720,
                "data": [{"name": "冬马和纱", "cartoonname": "白色相簿2", "acc_percent": 0.55}]
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/busy");
            then.status(200).json_body(json!({"new_code": 17702, "data": []}));
        })
        .await;

    let client = |path: &str| {
        CharacterTraceClient::new(
            reqwest::Client::new(),
            CharacterTraceSettings {
                api: server.url(path),
                ..Default::default()
            },
        )
    };

    let reply = client("/detect")
        .trace(&server.url("/image.png"), "gal")
        .await
        .unwrap();
    detect.assert_async().await;
    assert_eq!(
        reply,
        "识别结果：\n角色：冬马和纱\n出自：白色相簿2\n置信度：55.00%\n\n注意：置信度过低，识别结果仅供参考，请自行判断是否正确"
    );

    let busy = client("/busy").trace(&server.url("/image.png"), "").await.unwrap();
    assert_eq!(busy, "服务器繁忙，请重试(HTTP 状态码: 503)");
}
