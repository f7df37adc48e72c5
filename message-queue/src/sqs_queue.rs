// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::{anyhow, Context, Result};
use aws_auth::{sha256_hex, AwsCredentials, RequestSigner};
use backoff::{future::retry_notify, ExponentialBackoff};
use reqwest::{Client, Response, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const SQS_API_VERSION: &str = "2012-11-05";

pub const SEND_RETRY_DELAY: Duration = Duration::from_millis(500);
pub const MAX_ELAPSED_TIME: Duration = Duration::from_secs(2 * 60);

// <ReceiveMessageResponse>
// 	<ReceiveMessageResult>
// 		<Message>
// 			<MessageId>5fea7756-0ea4-451a-a703-a558b933e274</MessageId>
// 			<ReceiptHandle>MbZj6wDWli+JvwwJaBV+3dcjk2YW2vA3+ST...</ReceiptHandle>
// 			<MD5OfBody>fafb00f5732ab283681e124bf8747ed1</MD5OfBody>
// 			<Body>{"name":"agent.crash.new","data":{}}</Body>
// 		</Message>
// 	</ReceiveMessageResult>
// 	<ResponseMetadata>
// 		<RequestId>b6633655-283d-45b4-aee4-4e84e0ae6afa</RequestId>
// 	</ResponseMetadata>
// </ReceiveMessageResponse>

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReceiveMessageResponse {
    receive_message_result: ReceiveMessageResult,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReceiveMessageResult {
    #[serde(rename = "Message", default)]
    messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReceivedMessage {
    message_id: String,
    receipt_handle: String,
    body: String,
}

pub struct SqsQueueMessage {
    pub message_id: String,
    pub data: Vec<u8>,

    // licenses message deletion
    receipt_handle: String,
    client: SqsQueueClient,
}

impl SqsQueueMessage {
    pub async fn delete(self) -> Result<()> {
        self.client.delete_message(&self.receipt_handle).await
    }
}

#[derive(Clone)]
pub struct SqsQueueClient {
    http: Client,
    queue_url: Url,
    signer: RequestSigner,
}

impl SqsQueueClient {
    pub fn new(queue_url: Url, region: impl Into<String>, credentials: AwsCredentials) -> Self {
        Self {
            http: Client::new(),
            queue_url,
            signer: RequestSigner::new(credentials, region, "sqs"),
        }
    }

    pub async fn enqueue(&self, data: impl Serialize) -> Result<()> {
        let body = serde_json::to_string(&data)?;
        self.send_action(&[("Action", "SendMessage"), ("MessageBody", body.as_str())])
            .await
            .context("sqs enqueue failed")?;
        Ok(())
    }

    pub async fn pop(&self) -> Result<Option<SqsQueueMessage>> {
        let response = self
            .send_action(&[
                ("Action", "ReceiveMessage"),
                ("MaxNumberOfMessages", "1"),
                ("WaitTimeSeconds", "10"),
            ])
            .await
            .context("sqs receive failed")?;

        let text = response.text().await?;
        let parsed: ReceiveMessageResponse =
            quick_xml::de::from_str(&text).context("sqs receive response decode failed")?;

        let message = parsed
            .receive_message_result
            .messages
            .into_iter()
            .next()
            .map(|message| SqsQueueMessage {
                message_id: message.message_id,
                receipt_handle: message.receipt_handle,
                data: message.body.into_bytes(),
                client: self.clone(),
            });
        Ok(message)
    }

    async fn delete_message(&self, receipt_handle: &str) -> Result<()> {
        self.send_action(&[("Action", "DeleteMessage"), ("ReceiptHandle", receipt_handle)])
            .await
            .context("sqs delete failed")?;
        Ok(())
    }

    async fn send_action(&self, params: &[(&str, &str)]) -> Result<Response> {
        let body = {
            let mut form = url::form_urlencoded::Serializer::new(String::new());
            for (key, value) in params {
                form.append_pair(key, value);
            }
            form.append_pair("Version", SQS_API_VERSION);
            form.finish().clone()
        };

        let operation = || async {
            let mut request = self
                .http
                .post(self.queue_url.clone())
                .header("content-type", "application/x-www-form-urlencoded")
                .body(body.clone())
                .build()
                .map_err(|err| backoff::Error::permanent(anyhow::Error::from(err)))?;
            self.signer
                .sign(&mut request, &sha256_hex(&body))
                .map_err(|err| backoff::Error::permanent(anyhow::Error::from(err)))?;

            let response = self
                .http
                .execute(request)
                .await
                .map_err(|err| backoff::Error::transient(anyhow::Error::from(err)))?;

            let status = response.status();
            if status.is_success() {
                Ok(response)
            } else {
                let err = anyhow!("sqs request failed with status {status}");
                if status.is_server_error() {
                    Err(backoff::Error::transient(err))
                } else {
                    Err(backoff::Error::permanent(err))
                }
            }
        };

        let backoff = ExponentialBackoff {
            current_interval: SEND_RETRY_DELAY,
            initial_interval: SEND_RETRY_DELAY,
            max_elapsed_time: Some(MAX_ELAPSED_TIME),
            ..ExponentialBackoff::default()
        };
        let notify = |err, _| log::warn!("sqs request error, will retry: {}", err);
        retry_notify(backoff, operation, notify).await
    }
}
