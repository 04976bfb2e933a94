//! Client platform identifiers.

pub const IOS: i32 = 1;
pub const ANDROID: i32 = 2;
pub const WINDOWS: i32 = 3;
pub const OSX: i32 = 4;
pub const WEB: i32 = 5;
pub const MINI_WEB_APP: i32 = 6;
pub const LINUX: i32 = 7;
pub const ANDROID_PAD: i32 = 8;
pub const IPAD: i32 = 9;
pub const ADMIN: i32 = 10;

/// Human-readable platform name, or `""` for an id outside the table.
pub fn platform_name(platform_id: i32) -> &'static str {
    match platform_id {
        IOS => "IOS",
        ANDROID => "Android",
        WINDOWS => "Windows",
        OSX => "OSX",
        WEB => "Web",
        MINI_WEB_APP => "MiniWebApp",
        LINUX => "Linux",
        ANDROID_PAD => "APad",
        IPAD => "IPad",
        ADMIN => "Admin",
        _ => "",
    }
}
