//! Packet-type, sentinel, and limit constants for the Paltalk wire protocol.
//!
//! Values are taken directly from the reverse-engineered protocol headers;
//! names mirror their `PACKET_*` / `*_MAX` counterparts there.

/// Maximum length of a to-be-encoded/decoded string (ginger variants).
pub const ENCODE_MAX_LEN: usize = 128;
/// Maximum length of an encoded string accepted for decoding.
pub const DECODE_MAX_LEN: usize = 128 << 2;
/// Length of the generated v8.2+ codebook.
pub const CODEBOOK_LEN: usize = 0x558;
/// Highest usable challenge value (bounds how far into `ginger`/codebook we index).
pub const CHALLENGE_MAX: u16 = 226;

pub const NICKNAME_MAX: usize = 26;
pub const STATUSMSG_MAX: usize = 50;

// --- UID sentinels -----------------------------------------------------

pub const UID_ALL: u32 = 0xffff_ffff;
pub const UID_NOT_FOUND: u32 = 0xffff_fffe;
pub const UID_PALTALK: u32 = 0;
pub const UID_PALTALK_NOTIFIER: u32 = 0xffff_ffe4;
pub const UID_MIN: u32 = 2;
pub const UID_NEWUSER: u32 = 0x7fff_ffff;

pub fn uid_is_error(x: u32) -> bool {
    x == 0 || (x >> 31 != 0 && x != UID_NOT_FOUND && x != UID_PALTALK_NOTIFIER)
}

// --- Room / category constants ------------------------------------------

pub const ALL_ROOMS: u32 = 0xffff_ffff;
pub const ALL_CATEGORIES: u32 = 0xffff_ffff;

pub const ROOM_TYPE_TEXT: u32 = 0;
pub const ROOM_TYPE_PRIVATE_VOICE: u32 = 1;
pub const ROOM_TYPE_VOICE: u32 = 3;
pub const ROOM_TYPE_PRIVATE_TEXT: u32 = 5;
pub const ROOM_TYPE_ANONYMOUS: u32 = 7;

pub const CATEGORY_TOP: u32 = 0x7530;
pub const CATEGORY_FEATURED: u32 = 0x7594;

// --- Status words --------------------------------------------------------

pub const STATUS_BLOCKED: u32 = 0xffff_ffff;
pub const STATUS_OFFLINE: u32 = 0x0000_0000;
pub const STATUS_ONLINE: u32 = 0x0000_001e;
pub const STATUS_AWAY: u32 = 0x0000_0046;
pub const STATUS_DND: u32 = 0x0000_005a;
pub const STATUS_INVISIBLE: u32 = 0x0000_006e;

// --- Protocol versions ----------------------------------------------------

pub const PROTOCOL_VERSION: u16 = 0xdead;
pub const PROTOCOL_VERSION_50: u16 = 0x0047;
pub const PROTOCOL_VERSION_51: u16 = 0x004b;
pub const PROTOCOL_VERSION_70: u16 = 0x004f;
pub const PROTOCOL_VERSION_80: u16 = 0x0053;
pub const PROTOCOL_VERSION_82: u16 = 0x0056;
pub const PROTOCOL_VERSION_90: u16 = 0x0057;
pub const PROTOCOL_VERSION_91: u16 = 0x0058;

/// Packet type constants, named exactly as in the original headers
/// (`PACKET_` prefix dropped since the module path already disambiguates).
pub mod packet {
    // client -> server
    pub const FILE_XFER_RECV_INIT: u16 = 0x0000;
    pub const FILE_XFER_REJECT: u16 = 0xec76;
    pub const FILE_XFER_SEND_INIT: u16 = 0xec77;
    pub const SEARCH_ROOM: u16 = 0xf510;
    pub const GET_SERVICE_URL: u16 = 0xf5d8;
    pub const VERSION_INFO: u16 = 0xf7b0;
    pub const NEW_CHECKSUMS: u16 = 0xf7b1;
    pub const INCOMPATIBLE_3P_APP: u16 = 0xf7b3;
    pub const CHECKSUMS: u16 = 0xf7b5;
    pub const REGISTRY_INT_VALUE: u16 = 0xf7c9;
    pub const VERSIONS: u16 = 0xf7ca;
    pub const UID_FONTDEPTH_ETC: u16 = 0xf7cc;
    pub const SEND_GLOBAL_NUMBERS: u16 = 0xfa24;
    pub const REGISTRATION_INFO: u16 = 0xfa6a;
    pub const REGISTRATION_CHALLENGE: u16 = 0xfa73;
    pub const REGISTRATION: u16 = 0xfa74;
    pub const COMMENCING_AUTOJOIN: u16 = 0xfb00;
    pub const USER_FUCKER_STATUS: u16 = 0xfb0a;
    pub const VERIFY_EMAIL: u16 = 0xfb75;
    pub const EMAIL_VERIFIED: u16 = 0xfb76;
    pub const NEW_PASSWORD: u16 = 0xfb78;
    pub const LOGIN: u16 = 0xfb84;
    pub const GET_UID: u16 = 0xfb95;
    pub const INITIAL_STATUS: u16 = 0xfb96;
    pub const INITIAL_STATUS_2: u16 = 0xfba1;
    pub const CLIENT_DISCONNECT: u16 = 0xfbb4;
    pub const ROOM_CLOSE: u16 = 0xfc54;
    pub const ROOM_NEW_USER_MIC: u16 = 0xfc5c;
    pub const ROOM_REDDOT_VIDEO: u16 = 0xfc5d;
    pub const ROOM_REDDOT_TEXT: u16 = 0xfc5e;
    pub const ROOM_BAN_NICK: u16 = 0xfc66;
    pub const ROOM_UNBAN_USER: u16 = 0xfc67;
    pub const ROOM_BAN_USER: u16 = 0xfc68;
    pub const ROOM_UNBOUNCE_USER: u16 = 0xfc71;
    pub const ROOM_GET_ADMIN_INFO: u16 = 0xfc7c;
    pub const CHANGE_STATUS: u16 = 0xfd94;
    pub const UNBLOCK_BUDDY: u16 = 0xfdf8;
    pub const GET_PRIVACY: u16 = 0xfe02;
    pub const BLOCK_BUDDY: u16 = 0xfe0c;
    pub const SET_PRIVACY: u16 = 0xfe66;
    pub const ROOM_HAND_DOWN: u16 = 0xfe71;
    pub const ROOM_HAND_UP: u16 = 0xfe72;
    pub const ROOM_UNREDDOT_USER: u16 = 0xfe73;
    pub const ROOM_IGNORE_USER: u16 = 0xfe74;
    pub const ROOM_BOUNCE_REASON: u16 = 0xfe7a;
    pub const ROOM_MUTE: u16 = 0xfe81;
    pub const ROOM_LOWER_ALL_HANDS: u16 = 0xfe82;
    pub const ROOM_REDDOT_USER: u16 = 0xfe83;
    pub const ROOM_BOUNCE_USER: u16 = 0xfe84;
    pub const ROOM_INVITE_OUT: u16 = 0xfe98;
    pub const ROOM_SET_ALL_MICS: u16 = 0xfe9d;
    pub const ROOM_SET_TOPIC: u16 = 0xfea1;
    pub const ROOM_MESSAGE_OUT: u16 = 0xfea2;
    pub const LIST_SUBCATEGORY: u16 = 0xfeaf;
    pub const NEW_LIST_CATEGORY: u16 = 0xfeb0;
    pub const LIST_CATEGORY: u16 = 0xfeb6;
    pub const ROOM_LEAVE: u16 = 0xfec0;
    pub const ROOM_JOIN_AS_ADMIN2: u16 = 0xfec3;
    pub const ROOM_JOIN_AS_ADMIN: u16 = 0xfec4;
    pub const ROOM_JOIN: u16 = 0xfeca;
    pub const ROOM_REPORT_USER: u16 = 0xfecf;
    pub const ROOM_PRIVATE_INVITE: u16 = 0xfed2;
    pub const ROOM_CREATE: u16 = 0xfed4;
    pub const SEND_INVITE: u16 = 0xff38;
    pub const SET_BUDDY_DISPLAY_NAME: u16 = 0xff59;
    pub const PING: u16 = 0xff5e;
    pub const NUDGE_OUT: u16 = 0xff7b;
    pub const REGISTRATION_ADINFO: u16 = 0xff7e;
    pub const CLIENT_HELLO: u16 = 0xff9b;
    pub const PASSWORD_HINT: u16 = 0xffb9;
    pub const SEARCH_USER: u16 = 0xffbb;
    pub const UNKNOWN_USER: u16 = 0xffbc;
    pub const ADD_BUDDY: u16 = 0xffbd;
    pub const REMOVE_BUDDY: u16 = 0xffbe;
    pub const UPDATE_PROFILE: u16 = 0xffbf;
    pub const ANNOUNCEMENT: u16 = 0xffd9;
    pub const PERSONALS_MSG_OUT: u16 = 0xffe6;
    pub const IM_OUT: u16 = 0xffec;

    // server -> client
    pub const IM_IN: u16 = 0x0014;
    pub const PERSONALS_MSG_IN: u16 = 0x001a;
    pub const KICKUSER: u16 = 0x002a;
    pub const BUDDY_REMOVED: u16 = 0x0042;
    pub const BUDDY_LIST: u16 = 0x0043;
    pub const SEARCH_RESULTS2: u16 = 0x0044;
    pub const SEARCH_RESULTS: u16 = 0x0045;
    pub const RETURN_CODE: u16 = 0x0064;
    pub const COUNTRY_COREG: u16 = 0x0065;
    pub const HELLO: u16 = 0x0075;
    pub const UPGRADE: u16 = 0x0078;
    pub const NUDGE_IN: u16 = 0x0085;
    pub const ROOM_JOINED: u16 = 0x0136;
    pub const ROOM_USER_JOINED: u16 = 0x0137;
    pub const ROOM_TRANSMITTING_VIDEO: u16 = 0x0138;
    pub const ROOM_MEDIA_SERVER: u16 = 0x013b;
    pub const ROOM_USER_LEFT: u16 = 0x0140;
    pub const CATEGORY_COUNTS: u16 = 0x014b;
    pub const ROOM_LIST: u16 = 0x014c;
    pub const NEW_ROOM_LIST: u16 = 0x0150;
    pub const SUBCATEGORY_ROOM_LIST: u16 = 0x0151;
    pub const ROOM_USERLIST: u16 = 0x0154;
    pub const ROOM_MESSAGE_IN: u16 = 0x015e;
    pub const ROOM_TOPIC: u16 = 0x015f;
    pub const ROOM_SET_MIC: u16 = 0x0163;
    pub const ROOM_INVITE_IN: u16 = 0x0168;
    pub const TCP_VOICE_RECON: u16 = 0x0176;
    pub const ROOM_CLOSED: u16 = 0x017c;
    pub const ROOM_USER_REDDOT_ON: u16 = 0x017d;
    pub const ROOM_USER_MUTE: u16 = 0x017f;
    pub const ROOM_IGNORE: u16 = 0x018c;
    pub const ROOM_USER_REDDOT_OFF: u16 = 0x018d;
    pub const ROOM_USER_HAND_UP: u16 = 0x018e;
    pub const ROOM_USER_HAND_DOWN: u16 = 0x018f;
    pub const BUDDY_STATUSCHANGE: u16 = 0x0190;
    pub const USER_DATA: u16 = 0x019a;
    pub const VERIFY_PRIVACY: u16 = 0x019b;
    pub const CATEGORY_LIST: u16 = 0x019c;
    pub const SUBCATEGORY_LIST: u16 = 0x019e;
    pub const RESET_PARENTAL_CONTROLS: u16 = 0x019f;
    pub const BLOCK_RESPONSE: u16 = 0x01f4;
    pub const BLOCKED_BUDDIES: u16 = 0x01fe;
    pub const USER_STATUS: u16 = 0x026c;
    pub const FORCED_IM: u16 = 0x0294;
    pub const BANNER_INTERVAL: u16 = 0x02b2;
    pub const ROOM_BANNER_URL: u16 = 0x0320;
    pub const TARGET_BANNER_IM: u16 = 0x032a;
    pub const ROOM_ADMIN_INFO: u16 = 0x0384;
    pub const SERVER_DISCONNECT: u16 = 0x044c;
    pub const UID_RESPONSE: u16 = 0x046b;
    pub const CHALLENGE: u16 = 0x0474;
    pub const RESET_PASSWORD: u16 = 0x0488;
    pub const EXPIRATION_IN_DAYS: u16 = 0x048d;
    pub const SUBSCRIPTION_EXPIRED: u16 = 0x048e;
    pub const LOGIN_SUCCESS: u16 = 0x04a6;
    pub const PREPARE_USER_FUCKER: u16 = 0x04ec;
    pub const FUCK_USER: u16 = 0x04f6;
    pub const ROOM_PREMIUM: u16 = 0x0528;
    pub const DO_REGISTRATION: u16 = 0x058c;
    pub const REGISTRATION_SUCCESS: u16 = 0x05a0;
    pub const REGISTRATION_FAILED: u16 = 0x05a1;
    pub const REGISTRATION_NAME_IN_USE: u16 = 0x05aa;
    pub const GLOBAL_NUMBERS: u16 = 0x05dc;
    pub const CLIENT_CONTROL: u16 = 0x0834;
    pub const GET_REGISTRY_INT: u16 = 0x0837;
    pub const SET_REGISTRY_INT: u16 = 0x0838;
    pub const DELETE_REGISTRY_KEY: u16 = 0x0839;
    pub const ROOM_UNKNOWN_ENCODED: u16 = 0x084a;
    pub const INTEROP_URL: u16 = 0x0850;
    pub const POPUP_URL: u16 = 0x09c4;
    pub const SPECIAL_OFFER: u16 = 0x09d8;
    pub const SERVICE_URL: u16 = 0x0a28;
    pub const BUDDY_GROUPS_LIST: u16 = 0x0a8c;
    pub const BUDDY_GROUP_MEMBERS: u16 = 0x0a98;
    pub const ROOM_SEARCH_RESULTS: u16 = 0x0af0;
    pub const MY_ROOM_INFO: u16 = 0x0bc2;
    pub const REDIRECT: u16 = 0xff89;
    pub const SEARCH_ERROR: u16 = 0xffbb;
    pub const SEARCH_RESULTS3: u16 = 0xffbf;

    // PT5-specific
    pub const PT5_REGISTRATION: u16 = 0xfb6e;
    pub const OLD_CLIENT_HELLO: u16 = 0xff9c;
    pub const PT5_SEND_LOGIN: u16 = 0xffb1;
}
