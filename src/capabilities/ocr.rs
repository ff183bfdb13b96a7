//! Optical character recognition.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::{require_absolute, require_data, require_text, send_terminate};
use crate::bus::{Bus, BusValue};
use crate::config::ClientConfig;
use crate::error::{LastError, Result};
use crate::model::Region;
use crate::params::{Params, package_params};
use crate::reply::unpack_inline_error;
use crate::session::{Capability, SessionProxy};
use crate::state::ClientState;

#[derive(Debug)]
pub struct OcrClient {
    session: SessionProxy,
    state: ClientState,
    recognition_timeout: Duration,
}

impl OcrClient {
    pub fn new(bus: Arc<dyn Bus>, config: &ClientConfig) -> Self {
        Self {
            session: SessionProxy::new(bus, Capability::Ocr, config.timeout_for(Capability::Ocr)),
            state: ClientState::new(),
            recognition_timeout: config.recognition_timeout,
        }
    }

    pub fn connect(config: &ClientConfig) -> Self {
        Self::new(super::connect_bus(config), config)
    }

    /// Text in the image file at `image_file`, which must be absolute.
    ///
    /// The daemon reads the file itself, so existence is its call to judge.
    pub fn recognize_file(&self, image_file: impl AsRef<Path>, params: &Params) -> Result<String> {
        let result = require_absolute(image_file.as_ref(), "image file")
            .and_then(|path| self.recognize("recognizeFile", vec![path.into()], params));
        self.state.record(result)
    }

    /// Text in an encoded image held in memory.
    pub fn recognize_image(&self, image_data: &[u8], params: &Params) -> Result<String> {
        let result = require_data(image_data, "image data")
            .and_then(|()| self.recognize("recognizeImage", vec![image_data.into()], params));
        self.state.record(result)
    }

    /// Text inside `region` (`"x,y,width,height"`) of the image file.
    pub fn recognize_region(
        &self,
        image_file: impl AsRef<Path>,
        region: &str,
        params: &Params,
    ) -> Result<String> {
        let result = require_absolute(image_file.as_ref(), "image file").and_then(|path| {
            require_text(region, "region")?;
            self.recognize("recognizeRegion", vec![path.into(), region.into()], params)
        });
        self.state.record(result)
    }

    pub fn recognize_region_rect(
        &self,
        image_file: impl AsRef<Path>,
        region: Region,
        params: &Params,
    ) -> Result<String> {
        self.recognize_region(image_file, &region.to_string(), params)
    }

    fn recognize(&self, method: &str, mut args: Vec<BusValue>, params: &Params) -> Result<String> {
        self.session.ensure()?;
        let _guard = self.state.begin()?;

        args.push(BusValue::from(package_params(params)));
        let reply = self
            .session
            .call_with_timeout(method, args, self.recognition_timeout)?
            .into_string()?;
        unpack_inline_error(&reply, "text")
    }

    pub fn supported_languages(&self) -> Result<Vec<String>> {
        let result = self.query_list("getSupportedLanguages");
        self.state.record_query(result)
    }

    pub fn supported_formats(&self) -> Result<Vec<String>> {
        let result = self.query_list("getSupportedFormats");
        self.state.record_query(result)
    }

    /// Engine capability descriptor, as the daemon reports it.
    pub fn capabilities(&self) -> Result<String> {
        let result = self
            .session
            .call("getCapabilities", Vec::new())
            .and_then(|v| Ok(v.into_string()?));
        self.state.record_query(result)
    }

    fn query_list(&self, method: &str) -> Result<Vec<String>> {
        Ok(self.session.call(method, Vec::new())?.into_str_list()?)
    }

    pub fn terminate(&self) {
        send_terminate(&self.session, "terminate");
        self.state.force_idle();
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn last_error(&self) -> LastError {
        self.state.last_error()
    }
}
