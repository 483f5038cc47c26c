use anyhow::Result;

use super::Client;

impl Client {
    /// Start printing the most recently uploaded file.
    pub async fn start_print(&self) -> Result<()> {
        self.post_form("start_print", &[]).await?;
        Ok(())
    }

    /// Pause a print job.
    pub async fn pause_print(&self) -> Result<()> {
        self.post_form("pause_print", &[]).await?;
        Ok(())
    }

    /// Resume a print job.
    pub async fn resume_print(&self) -> Result<()> {
        self.post_form("resume_print", &[]).await?;
        Ok(())
    }

    /// Stop a print job.
    pub async fn stop_print(&self) -> Result<()> {
        self.post_form("stop_print", &[]).await?;
        Ok(())
    }

    /// Run raw G-code on the machine.
    pub async fn execute_code(&self, code: &str) -> Result<()> {
        self.post_form("execute_code", &[("code", code.to_owned())]).await?;
        Ok(())
    }

    /// Override the work speed, in percent of the sliced speed.
    pub async fn override_work_speed(&self, percent: u32) -> Result<()> {
        self.post_form("override_work_speed", &[("workSpeed", percent.to_string())])
            .await?;
        Ok(())
    }

    /// Override laser power, in percent.
    pub async fn override_laser_power(&self, percent: f64) -> Result<()> {
        self.post_form("override_laser_power", &[("laserPower", percent.to_string())])
            .await?;
        Ok(())
    }

    /// Load filament into the nozzle.
    pub async fn filament_load(&self) -> Result<()> {
        self.post_form("filament_load", &[]).await?;
        Ok(())
    }

    /// Unload filament from the nozzle.
    pub async fn filament_unload(&self) -> Result<()> {
        self.post_form("filament_unload", &[]).await?;
        Ok(())
    }
}
