use crate::config::local::MailConfig;
use crate::error::{MailError, Result};
use crate::export::ExportFormat;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};

/// Parses a single recipient address.
pub fn parse_address(address: &str) -> std::result::Result<Mailbox, MailError> {
    address
        .trim()
        .parse::<Mailbox>()
        .map_err(|e| MailError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

pub fn subject(job_name: &str) -> String {
    format!("Job {} ran successfully on querycron!", job_name)
}

pub fn body(job_name: &str) -> String {
    format!(
        "Dear users,\n\n\
         Please kindly notice that the job \"{}\" ran successfully.\n\
         We attached the result in this email for your later check.\n\n\
         querycron.",
        job_name
    )
}

pub fn attachment_name(tracker_id: i64) -> String {
    format!("Result_tid_{}.xlsx", tracker_id)
}

/// Builds the notification for a successful run, with the XLSX result attached.
pub fn build_message(
    from: &Mailbox,
    recipients: &[String],
    job_name: &str,
    tracker_id: i64,
    xlsx: Vec<u8>,
) -> Result<Message> {
    let mut builder = Message::builder()
        .from(from.clone())
        .subject(subject(job_name));
    for recipient in recipients {
        builder = builder.to(parse_address(recipient)?);
    }

    let content_type = ContentType::parse(ExportFormat::Xlsx.content_type())
        .map_err(|e| MailError::BuildFailed(e.to_string()))?;
    let attachment = Attachment::new(attachment_name(tracker_id)).body(xlsx, content_type);

    let message = builder
        .multipart(
            MultiPart::mixed()
                .singlepart(SinglePart::plain(body(job_name)))
                .singlepart(attachment),
        )
        .map_err(|e| MailError::BuildFailed(e.to_string()))?;
    Ok(message)
}

/// Sends result notifications over SMTP.
pub struct ResultMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl ResultMailer {
    pub fn from_config(config: &MailConfig) -> Result<Self> {
        let from = parse_address(&config.from)?;

        let mut builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .map_err(|e| MailError::BuildFailed(e.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        };
        builder = builder.port(config.smtp_port);
        if let Some(username) = &config.username {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                config.password.clone().unwrap_or_default(),
            ));
        }

        debug!(
            host = %config.smtp_host,
            port = config.smtp_port,
            starttls = config.starttls,
            "Mail transport configured"
        );
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    pub async fn send_result(
        &self,
        recipients: &[String],
        job_name: &str,
        tracker_id: i64,
        xlsx: Vec<u8>,
    ) -> Result<()> {
        let message = build_message(&self.from, recipients, job_name, tracker_id, xlsx)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| MailError::SendFailed(e.to_string()))?;

        info!(
            tracker_id = tracker_id,
            recipients = recipients.len(),
            "Result mail sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> Mailbox {
        parse_address("querycron@example.com").expect("valid address")
    }

    #[test]
    fn test_message_carries_result_attachment() {
        let message = build_message(
            &sender(),
            &["ops@example.com".to_string(), "Ana <ana@example.com>".to_string()],
            "nightly sales",
            42,
            vec![b'P', b'K', 3, 4],
        )
        .expect("message should build");

        let raw = String::from_utf8_lossy(&message.formatted()).to_string();
        assert!(raw.contains("Subject: Job nightly sales ran successfully on querycron!"));
        assert!(raw.contains("ops@example.com"));
        assert!(raw.contains("ana@example.com"));
        assert!(raw.contains("Result_tid_42.xlsx"));
        assert!(raw.contains("spreadsheetml.sheet"));
        assert!(raw.contains("ran successfully."));
    }

    #[test]
    fn test_invalid_recipient_is_rejected() {
        let result = build_message(&sender(), &["not an address".to_string()], "job", 1, Vec::new());

        assert!(matches!(
            result,
            Err(crate::error::AppError::Mail(MailError::InvalidAddress { .. }))
        ));
    }

    #[test]
    fn test_body_names_the_job() {
        assert!(body("exports").contains("the job \"exports\" ran successfully"));
        assert_eq!(attachment_name(7), "Result_tid_7.xlsx");
    }

    #[tokio::test]
    async fn test_mailer_builds_from_config() {
        let config = MailConfig {
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 2525,
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            from: "querycron@example.com".to_string(),
            starttls: false,
        };

        assert!(ResultMailer::from_config(&config).is_ok());

        let bad = MailConfig {
            from: "nobody".to_string(),
            ..config
        };
        assert!(ResultMailer::from_config(&bad).is_err());
    }
}
