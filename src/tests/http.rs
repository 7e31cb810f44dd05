use super::*;
use crate::auction::validator::Rejection;
use crate::service::{router, ApiError, AppState, AuctionError, USER_ID_HEADER};
use anyhow::{format_err, Result};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn status(err: ApiError) -> StatusCode {
    err.into_response().status()
}

#[test]
fn rejections_map_to_client_errors() -> Result<()> {
    for (rejection, expected) in [
        (Rejection::RoomNotFound, StatusCode::NOT_FOUND),
        (Rejection::NotHost, StatusCode::FORBIDDEN),
        (Rejection::NotInRoom, StatusCode::FORBIDDEN),
        (Rejection::ItemChanged, StatusCode::CONFLICT),
        (Rejection::AlreadyHighestBidder, StatusCode::CONFLICT),
        (Rejection::BelowFloor { floor: 110 }, StatusCode::BAD_REQUEST),
        (Rejection::NotLive, StatusCode::BAD_REQUEST),
        (Rejection::InvalidAmount, StatusCode::BAD_REQUEST),
    ] {
        assert_eq!(
            status(AuctionError::Rejected(rejection).into()),
            expected,
            "{rejection:?}"
        );
    }
    Ok(())
}

#[test]
fn failures_are_not_blamed_on_the_caller() -> Result<()> {
    assert_eq!(status(ApiError::Unauthenticated), StatusCode::UNAUTHORIZED);
    assert_eq!(
        status(
            AuctionError::BudgetConflict {
                bidder: "bidder-x".to_owned(),
                price: 500,
                budget: 100,
            }
            .into()
        ),
        StatusCode::CONFLICT
    );
    assert_eq!(
        status(AuctionError::Inconsistent("no state".to_owned()).into()),
        StatusCode::INTERNAL_SERVER_ERROR
    );
    assert_eq!(
        status(AuctionError::Store(format_err!("connection reset")).into()),
        StatusCode::INTERNAL_SERVER_ERROR
    );
    assert_eq!(
        status(format_err!("boom").into()),
        StatusCode::INTERNAL_SERVER_ERROR
    );
    Ok(())
}

/// Send one raw HTTP/1.1 request and return the whole response
async fn send(addr: SocketAddr, request: String) -> Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request.as_bytes()).await?;
    let mut response = vec![];
    stream.read_to_end(&mut response).await?;
    Ok(String::from_utf8(response)?)
}

fn bid_request(user: Option<&str>, body: &str) -> String {
    let user = user
        .map(|u| format!("{USER_ID_HEADER}: {u}\r\n"))
        .unwrap_or_default();
    format!(
        "POST /rooms/{ROOM}/bids HTTP/1.1\r\n\
         host: localhost\r\n\
         {user}\
         content-type: application/json\r\n\
         content-length: {}\r\n\
         connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
}

#[tokio::test]
async fn malformed_bids_get_a_reason() -> Result<()> {
    let f = Fixture::new().await;
    let bind: SocketAddr = "127.0.0.1:0".parse()?;
    let server = axum::Server::try_bind(&bind)?.serve(
        router(AppState {
            runtime: f.runtime.clone(),
            events: f.events.clone(),
        })
        .into_make_service(),
    );
    let addr = server.local_addr();
    tokio::spawn(server);

    for body in [
        r#"{"amount":-5}"#,
        r#"{"amount":100.5}"#,
        r#"{"amount":"100"}"#,
        r#"{}"#,
        "amount=100",
    ] {
        let response = send(addr, bid_request(Some(USER_X), body)).await?;
        assert!(response.starts_with("HTTP/1.1 400"), "{body}: {response}");
        assert!(
            response.contains(r#""reason":"invalid_amount""#),
            "{body}: {response}"
        );
        assert!(response.contains(r#""message":"#), "{body}: {response}");
        assert!(!response.contains("deserialize"), "{body}: {response}");
    }

    // a well-formed bid reaches the auction checks
    let response = send(addr, bid_request(Some(USER_X), r#"{"amount":100}"#)).await?;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    assert!(response.contains(r#""reason":"auction_not_live""#), "{response}");

    f.runtime.start_auction(HOST, ROOM).await?;
    let response = send(addr, bid_request(Some(USER_X), r#"{"amount":100}"#)).await?;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#""success":true"#), "{response}");

    let response = send(addr, bid_request(None, r#"{"amount":150}"#)).await?;
    assert!(response.starts_with("HTTP/1.1 401"), "{response}");
    assert!(response.contains(r#""reason":"unauthenticated""#), "{response}");

    f.runtime.shutdown();
    Ok(())
}
