use windows::Graphics::DirectX::Direct3D11::IDirect3DDevice;
use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::{
    D3D_DRIVER_TYPE_HARDWARE, D3D_FEATURE_LEVEL, D3D_FEATURE_LEVEL_10_0, D3D_FEATURE_LEVEL_10_1,
    D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_11_1,
};
use windows::Win32::Graphics::Direct3D11::{
    D3D11_CPU_ACCESS_READ, D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_MAP_READ, D3D11_MAPPED_SUBRESOURCE,
    D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING, D3D11CreateDevice, ID3D11Device,
    ID3D11DeviceContext, ID3D11Texture2D,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::IDXGIDevice;
use windows::Win32::System::WinRT::Direct3D11::CreateDirect3D11DeviceFromDXGIDevice;
use windows::core::Interface;

/// Moves a COM object into a callback that must be `Send`.
///
/// Only sound for objects the capture thread alone touches.
pub struct SendDirectX<T>(pub T);

impl<T> SendDirectX<T> {
    #[must_use]
    #[inline]
    pub const fn new(device: T) -> Self {
        Self(device)
    }
}

#[allow(clippy::non_send_fields_in_send_ty)]
unsafe impl<T> Send for SendDirectX<T> {}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to create a DirectX device with feature level 11.0 or higher")]
    FeatureLevelNotSatisfied,
    #[error("DirectX returned no device")]
    NoDevice,
    #[error("DirectX returned no staging texture")]
    NoStagingTexture,
    #[error("Windows API error: {0}")]
    WindowsError(#[from] windows::core::Error),
}

/// Creates a hardware `ID3D11Device` with BGRA support and its immediate context.
///
/// # Errors
///
/// Returns `Error::FeatureLevelNotSatisfied` on adapters below feature level 11.0.
#[inline]
pub fn create_d3d_device() -> Result<(ID3D11Device, ID3D11DeviceContext), Error> {
    let feature_flags = [D3D_FEATURE_LEVEL_11_1, D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_10_1, D3D_FEATURE_LEVEL_10_0];

    let mut d3d_device = None;
    let mut feature_level = D3D_FEATURE_LEVEL::default();
    let mut d3d_device_context = None;
    unsafe {
        D3D11CreateDevice(
            None,
            D3D_DRIVER_TYPE_HARDWARE,
            HMODULE::default(),
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            Some(&feature_flags),
            D3D11_SDK_VERSION,
            Some(&mut d3d_device),
            Some(&mut feature_level),
            Some(&mut d3d_device_context),
        )?;
    };

    if feature_level.0 < D3D_FEATURE_LEVEL_11_0.0 {
        return Err(Error::FeatureLevelNotSatisfied);
    }

    match (d3d_device, d3d_device_context) {
        (Some(device), Some(context)) => Ok((device, context)),
        _ => Err(Error::NoDevice),
    }
}

/// Wraps an `ID3D11Device` into the WinRT device the frame pool expects.
///
/// # Errors
///
/// Returns an `Error` if the device doesn't expose DXGI.
#[inline]
pub fn create_direct3d_device(d3d_device: &ID3D11Device) -> Result<IDirect3DDevice, Error> {
    let dxgi_device: IDXGIDevice = d3d_device.cast()?;
    let inspectable = unsafe { CreateDirect3D11DeviceFromDXGIDevice(&dxgi_device)? };
    let device: IDirect3DDevice = inspectable.cast()?;

    Ok(device)
}

/// CPU readable copy target for captured surfaces.
///
/// Kept across frames and only recreated when the surface size or format
/// changes.
pub struct StagingTexture {
    texture: ID3D11Texture2D,
    desc: D3D11_TEXTURE2D_DESC,
}

impl StagingTexture {
    /// Creates a staging texture of the given size and format.
    ///
    /// # Errors
    ///
    /// Returns an `Error` if the device can't allocate the texture.
    #[inline]
    pub fn new(device: &ID3D11Device, width: u32, height: u32, format: DXGI_FORMAT) -> Result<Self, Error> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: format,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: 0,
        };

        let mut texture = None;
        unsafe { device.CreateTexture2D(&desc, None, Some(&mut texture))? };

        Ok(Self { texture: texture.ok_or(Error::NoStagingTexture)?, desc })
    }

    /// Checks if a surface described by `desc` can be copied into this texture.
    #[must_use]
    #[inline]
    pub fn fits(&self, desc: &D3D11_TEXTURE2D_DESC) -> bool {
        self.desc.Width == desc.Width && self.desc.Height == desc.Height && self.desc.Format == desc.Format
    }

    /// Copies `source` into the staging texture and maps it for reading.
    ///
    /// `read` gets the mapped rows and their pitch. The texture is unmapped
    /// before this returns.
    ///
    /// # Errors
    ///
    /// Returns an `Error` if mapping fails, typically because the device was
    /// removed.
    #[inline]
    pub fn read<R>(
        &self,
        context: &ID3D11DeviceContext,
        source: &ID3D11Texture2D,
        read: impl FnOnce(&[u8], usize) -> R,
    ) -> Result<R, Error> {
        unsafe { context.CopyResource(&self.texture, source) };

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe { context.Map(&self.texture, 0, D3D11_MAP_READ, 0, Some(&mut mapped))? };

        let row_pitch = mapped.RowPitch as usize;
        let len = row_pitch * self.desc.Height as usize;
        // SAFETY: the mapping covers `Height` rows of `RowPitch` bytes and stays
        // valid until `Unmap` below.
        let data = unsafe { std::slice::from_raw_parts(mapped.pData.cast::<u8>(), len) };
        let result = read(data, row_pitch);

        unsafe { context.Unmap(&self.texture, 0) };

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_texture_is_not_reported_as_missing_device() {
        assert_ne!(Error::NoStagingTexture.to_string(), Error::NoDevice.to_string());
        assert!(Error::NoStagingTexture.to_string().contains("staging texture"));
    }
}
