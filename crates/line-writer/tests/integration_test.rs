// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::helpers::{count_events, fast_retry_config, http_transport};
use common::mocks::RecordingTransport;
use line_writer::{
    DefaultTags, Lifecycle, PipelineConfig, Point, WriteError, WritePrecision, WriteService,
};
use mockito::{Matcher, Server};
use std::time::Duration;

#[cfg(test)]
#[tokio::test]
async fn test_rate_limited_write_is_retried_after_server_delay() {
    let mut server = Server::new_async().await;
    let rate_limited = server
        .mock("POST", "/api/v2/write")
        .match_query(Matcher::Any)
        .with_status(429)
        .with_header("Retry-After", "1")
        .expect(1)
        .create_async()
        .await;
    let accepted = server
        .mock("POST", "/api/v2/write")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("org".into(), "my-org".into()),
            Matcher::UrlEncoded("bucket".into(), "my-bucket".into()),
            Matcher::UrlEncoded("precision".into(), "ns".into()),
        ]))
        .match_header("Authorization", "Token my-token")
        .match_body("test,t=\\ ,xtra=1 value=1")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let config = PipelineConfig {
        default_tags: DefaultTags::from_pairs([("xtra", "1")]),
        ..fast_retry_config(3)
    };
    let handle = WriteService::spawn(config, http_transport(server.url()))
        .expect("failed to spawn write service");
    let mut events = handle.subscribe();

    handle
        .write_point(
            &Point::new("test")
                .tag("t", " ")
                .float_field("value", 1.0)
                .without_timestamp(),
        )
        .expect("write rejected");

    let started = tokio::time::Instant::now();
    handle.close().await.expect("close failed");
    assert!(started.elapsed() >= Duration::from_secs(1));

    assert_eq!(count_events(&mut events), (1, 0));
    rate_limited.assert_async().await;
    accepted.assert_async().await;
}

#[cfg(test)]
#[tokio::test]
async fn test_bad_request_fails_flush_without_retry() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v2/write")
        .match_query(Matcher::Any)
        .with_status(400)
        .with_body("unable to parse")
        .expect(1)
        .create_async()
        .await;

    let handle = WriteService::spawn(fast_retry_config(3), http_transport(server.url()))
        .expect("failed to spawn write service");
    let mut events = handle.subscribe();

    handle.write_record("not line protocol").unwrap();
    let result = handle.flush().await;
    assert!(matches!(
        result,
        Err(WriteError::FatalRequest {
            status: Some(400),
            ..
        })
    ));
    assert_eq!(count_events(&mut events), (0, 1));

    // the failed batch is gone, close has nothing left to report
    assert_eq!(handle.close().await, Ok(()));
    mock.assert_async().await;
}

#[cfg(test)]
#[tokio::test]
async fn test_close_without_server_reports_exhausted_retries() {
    // nothing listens on port 9 of the loopback interface
    let handle = WriteService::spawn(
        fast_retry_config(3),
        http_transport("http://127.0.0.1:9".to_string()),
    )
    .expect("failed to spawn write service");
    let mut events = handle.subscribe();

    handle.write_record("test value=1").unwrap();
    let result = handle.close().await;
    assert!(matches!(
        result,
        Err(WriteError::RetryExhausted { attempts: 4, .. })
    ));
    assert_eq!(count_events(&mut events), (3, 1));
    assert_eq!(handle.lifecycle(), Lifecycle::Closed);
}

#[cfg(test)]
#[tokio::test]
async fn test_close_without_server_and_no_retries() {
    let handle = WriteService::spawn(
        fast_retry_config(0),
        http_transport("http://127.0.0.1:9".to_string()),
    )
    .expect("failed to spawn write service");
    let mut events = handle.subscribe();

    handle.write_record("test value=1").unwrap();
    assert!(handle.close().await.is_err());
    assert_eq!(count_events(&mut events), (0, 1));
}

#[cfg(test)]
#[tokio::test]
async fn test_flush_and_close_without_data_succeed() {
    let handle = WriteService::spawn(
        fast_retry_config(3),
        http_transport("http://127.0.0.1:9".to_string()),
    )
    .expect("failed to spawn write service");

    assert_eq!(handle.flush().await, Ok(()));
    assert_eq!(handle.close().await, Ok(()));
    assert_eq!(handle.write_record("test value=1"), Err(WriteError::Closed));
}

#[cfg(test)]
#[tokio::test]
async fn test_points_get_timestamp_in_write_precision() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v2/write")
        .match_query(Matcher::UrlEncoded("precision".into(), "ms".into()))
        .match_body(Matcher::Regex(r"^cpu,host=a usage=0\.5 \d{13}$".to_string()))
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let config = PipelineConfig {
        precision: WritePrecision::Milliseconds,
        default_tags: DefaultTags::parse("host=a"),
        ..fast_retry_config(0)
    };
    let handle = WriteService::spawn(config, http_transport(server.url()))
        .expect("failed to spawn write service");

    handle
        .write_point(&Point::new("cpu").float_field("usage", 0.5))
        .unwrap();
    handle.close().await.expect("close failed");
    mock.assert_async().await;
}

#[cfg(test)]
#[tokio::test]
async fn test_writes_from_cloned_handles_are_delivered_in_order() {
    let transport = RecordingTransport::new();
    let config = PipelineConfig {
        batch_size: 7,
        ..fast_retry_config(0)
    };
    let handle = WriteService::spawn(config, transport.clone())
        .expect("failed to spawn write service");

    let writers: Vec<_> = (0..4)
        .map(|writer| {
            let handle = handle.clone();
            tokio::spawn(async move {
                for i in 0..25 {
                    handle
                        .write_record(format!("m,writer={writer} seq={i}i"))
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }
    handle.close().await.expect("close failed");

    let lines = transport.lines();
    assert_eq!(lines.len(), 100);
    for writer in 0..4 {
        let prefix = format!("m,writer={writer} ");
        let sequence: Vec<String> = lines
            .iter()
            .filter(|line| line.starts_with(&prefix))
            .cloned()
            .collect();
        let expected: Vec<String> = (0..25)
            .map(|i| format!("m,writer={writer} seq={i}i"))
            .collect();
        assert_eq!(sequence, expected);
    }
    assert!(transport
        .payloads()
        .iter()
        .all(|payload| payload.split('\n').count() <= 7));
    assert!(transport
        .precisions()
        .iter()
        .all(|p| *p == WritePrecision::Nanoseconds));
}

#[cfg(test)]
#[tokio::test]
async fn test_dropping_every_handle_drains_buffered_records() {
    let transport = RecordingTransport::new();
    let (service, handle) = WriteService::new(fast_retry_config(0), transport.clone())
        .expect("failed to create write service");
    let service_task = tokio::spawn(service.run());

    handle
        .write_records(["a value=1", "b value=2", "c value=3"])
        .unwrap();
    drop(handle);

    tokio::time::timeout(Duration::from_secs(5), service_task)
        .await
        .expect("service did not stop")
        .expect("service task failed");
    assert_eq!(transport.payloads(), vec!["a value=1\nb value=2\nc value=3"]);
}
