use std::path::Path;

use anyhow::{Context, Result};
use bytes::Bytes;
use reqwest::multipart;

use super::Client;

impl Client {
    /// Upload a file with some gcode to the machine.
    pub async fn upload_file(&self, file_name: &Path) -> Result<()> {
        let name = file_name
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("{} has no usable file name", file_name.display()))?
            .to_owned();
        let contents = tokio::fs::read(file_name).await?;
        self.upload(&name, contents.into()).await
    }

    /// Upload a byte array of gcode as `file_name`. The machine keeps it as
    /// the file that `start_print` will run.
    pub async fn upload(&self, file_name: &str, gcode: Bytes) -> Result<()> {
        tracing::debug!(base = self.url_base, file_name, len = gcode.len(), "uploading");
        let part = multipart::Part::bytes(gcode.to_vec())
            .file_name(file_name.to_owned())
            .mime_str("text/x-gcode")?;

        self.http
            .post(format!("{}/upload", self.url_base))
            .multipart(
                multipart::Form::new()
                    .text("token", self.token.clone())
                    .part("file", part),
            )
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use crate::{testing::one_shot, Client};

    #[tokio::test]
    async fn test_upload_multipart() -> TestResult {
        let (port, server) = one_shot("200 OK", "{}").await;
        let client = Client::new("127.0.0.1", port, "abc");

        client.upload("part.gcode", "G28\nG1 X10\n".into()).await?;

        let request = server.await?;
        assert!(request.starts_with("POST /api/v1/upload "));
        assert!(request.contains("name=\"token\"\r\n\r\nabc"));
        assert!(request.contains("filename=\"part.gcode\""));
        assert!(request.contains("G28\nG1 X10\n"));
        Ok(())
    }
}
