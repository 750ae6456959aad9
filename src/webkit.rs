//! WebKit source version lookup.
//!
//! The cached WebKit framework carries an `LC_SOURCE_VERSION`, which is the
//! quickest way to tell which Safari/WebKit release a cache ships.

use tracing::debug;

use crate::dyld::CacheImage;
use crate::error::{Error, Result};
use crate::macho::SourceVersion;
use crate::DyldContext;

/// Path of the WebKit framework inside the cache.
pub const WEBKIT_IMAGE: &str = "/System/Library/Frameworks/WebKit.framework/WebKit";

/// Returns the source version of the cached WebKit framework.
pub fn webkit_version(cache: &DyldContext) -> Result<SourceVersion> {
    let image = CacheImage::new(cache, WEBKIT_IMAGE)
        .or_else(|_| CacheImage::new(cache, "WebKit"))?;

    let version = image
        .macho()
        .source_version()
        .ok_or_else(|| Error::SourceVersionNotFound {
            image: image.entry().path.clone(),
        })?;

    debug!("{} source version {}", image.entry().path, version);
    Ok(version)
}
