//! Protocol constants and the command catalogue shared with robot firmware.
//!
//! Every string and integer in this module is compared byte-for-byte by the
//! firmware. Do not "tidy" them.

use serde::{Deserialize, Serialize};

/// Port of the robot's local HTTP signaling endpoint.
pub const SIGNALING_PORT: u16 = 9991;

/// Prefix hashed together with each validation challenge.
pub const VENDOR_PREFIX: &str = "UnitreeGo2";

/// Validation payload that marks the end of the challenge exchange.
pub const VALIDATION_OK: &str = "Validation Ok.";

/// Session description the robot returns when it already has a peer.
pub const SDP_REJECT: &str = "reject";

/// Label of the data channel the robot expects.
pub const DATA_CHANNEL_LABEL: &str = "data";

/// Topic paths used on the data channel.
pub mod topic {
    /// Low-level joint state stream.
    pub const LOW_STATE: &str = "rt/lf/lowstate";
    /// Aggregated robot state.
    pub const MULTIPLE_STATE: &str = "rt/multiplestate";
    /// Front camera photo request.
    pub const FRONT_PHOTO_REQ: &str = "rt/api/videohub/request";
    /// LiDAR on/off switch.
    pub const ULIDAR_SWITCH: &str = "rt/utlidar/switch";
    /// LiDAR voxel map.
    pub const ULIDAR: &str = "rt/utlidar/voxel_map";
    /// Compressed LiDAR voxel map.
    pub const ULIDAR_ARRAY: &str = "rt/utlidar/voxel_map_compressed";
    /// LiDAR status.
    pub const ULIDAR_STATE: &str = "rt/utlidar/lidar_state";
    /// Robot odometry pose.
    pub const ROBOTODOM: &str = "rt/utlidar/robot_pose";
    /// UWB switch request.
    pub const UWB_REQ: &str = "rt/api/uwbswitch/request";
    /// UWB state.
    pub const UWB_STATE: &str = "rt/uwbstate";
    /// Low-level command stream.
    pub const LOW_CMD: &str = "rt/lowcmd";
    /// Virtual joystick input.
    pub const WIRELESS_CONTROLLER: &str = "rt/wirelesscontroller";
    /// Sport mode request.
    pub const SPORT_MOD: &str = "rt/api/sport/request";
    /// Sport mode response.
    pub const SPORT_RESPONSE: &str = "rt/api/sport/response";
    /// Sport mode state.
    pub const SPORT_MOD_STATE: &str = "rt/sportmodestate";
    /// Low-frequency sport mode state.
    pub const LF_SPORT_MOD_STATE: &str = "rt/lf/sportmodestate";
    /// Bash runner request.
    pub const BASH_REQ: &str = "rt/api/bashrunner/request";
    /// Self test results.
    pub const SELF_TEST: &str = "rt/selftest";
    /// Occupancy grid map.
    pub const GRID_MAP: &str = "rt/mapping/grid_map";
    /// Service state.
    pub const SERVICE_STATE: &str = "rt/servicestate";
    /// GPT flow feedback.
    pub const GPT_FEEDBACK: &str = "rt/gptflowfeedback";
    /// Voice/light UI request.
    pub const VUI: &str = "rt/api/vui/request";
    /// Obstacle avoidance request.
    pub const OBSTACLES_AVOID: &str = "rt/api/obstacles_avoid/request";
    /// SLAM command.
    pub const SLAM_QT_COMMAND: &str = "rt/qt_command";
    /// SLAM add node.
    pub const SLAM_ADD_NODE: &str = "rt/qt_add_node";
    /// SLAM add edge.
    pub const SLAM_ADD_EDGE: &str = "rt/qt_add_edge";
    /// SLAM notice.
    pub const SLAM_QT_NOTICE: &str = "rt/qt_notice";
    /// SLAM local point cloud image.
    pub const SLAM_PC_TO_IMAGE_LOCAL: &str = "rt/pctoimage_local";
    /// SLAM odometry.
    pub const SLAM_ODOMETRY: &str = "rt/lio_sam_ros2/mapping/odometry";
    /// Arm command.
    pub const ARM_COMMAND: &str = "rt/arm_Command";
    /// Arm feedback.
    pub const ARM_FEEDBACK: &str = "rt/arm_Feedback";
    /// Audio hub request.
    pub const AUDIO_HUB_REQ: &str = "rt/api/audiohub/request";
    /// Audio hub player state.
    pub const AUDIO_HUB_PLAY_STATE: &str = "rt/audiohub/player/state";
    /// Gas sensor readings.
    pub const GAS_SENSOR: &str = "rt/gas_sensor";
    /// Gas sensor request.
    pub const GAS_SENSOR_REQ: &str = "rt/api/gas_sensor/request";
    /// LiDAR mapping client command.
    pub const LIDAR_MAPPING_CMD: &str = "rt/uslam/client_command";
    /// LiDAR mapping downsampled cloud.
    pub const LIDAR_MAPPING_CLOUD_POINT: &str = "rt/uslam/frontend/cloud_world_ds";
    /// LiDAR mapping odometry.
    pub const LIDAR_MAPPING_ODOM: &str = "rt/uslam/frontend/odom";
    /// LiDAR mapping PCD file.
    pub const LIDAR_MAPPING_PCD_FILE: &str = "rt/uslam/cloud_map";
    /// LiDAR mapping server log.
    pub const LIDAR_MAPPING_SERVER_LOG: &str = "rt/uslam/server_log";
    /// LiDAR localization odometry.
    pub const LIDAR_LOCALIZATION_ODOM: &str = "rt/uslam/localization/odom";
    /// LiDAR navigation global path.
    pub const LIDAR_NAVIGATION_GLOBAL_PATH: &str = "rt/uslam/navigation/global_path";
    /// LiDAR localization cloud.
    pub const LIDAR_LOCALIZATION_CLOUD_POINT: &str = "rt/uslam/localization/cloud_world";
    /// Programming actuator command.
    pub const PROGRAMMING_ACTUATOR_CMD: &str = "rt/programming_actuator/command";
    /// Assistant recorder request.
    pub const ASSISTANT_RECORDER: &str = "rt/api/assistant_recorder/request";
    /// Motion switcher request.
    pub const MOTION_SWITCHER: &str = "rt/api/motion_switcher/request";
    /// Motion switcher response.
    pub const MOTION_SWITCHER_RESPONSE: &str = "rt/api/motion_switcher/response";
    /// Pet mode request.
    pub const PET: &str = "rt/api/pet/request";
}

/// Returns the topic a request's answer arrives on, if it differs from the
/// request topic.
///
/// # Examples
///
/// ```
/// use qlink_common::types::{response_topic, topic};
///
/// assert_eq!(response_topic(topic::SPORT_MOD), Some(topic::SPORT_RESPONSE));
/// assert_eq!(response_topic(topic::VUI), None);
/// ```
#[must_use]
pub fn response_topic(request: &str) -> Option<&'static str> {
    match request {
        topic::SPORT_MOD => Some(topic::SPORT_RESPONSE),
        topic::MOTION_SWITCHER => Some(topic::MOTION_SWITCHER_RESPONSE),
        _ => None,
    }
}

/// Sport service command codes (`api_id`).
pub mod sport_cmd {
    #![allow(missing_docs)]
    pub const DAMP: u32 = 1001;
    pub const BALANCE_STAND: u32 = 1002;
    pub const STOP_MOVE: u32 = 1003;
    pub const STAND_UP: u32 = 1004;
    pub const STAND_DOWN: u32 = 1005;
    pub const RECOVERY_STAND: u32 = 1006;
    pub const EULER: u32 = 1007;
    pub const MOVE: u32 = 1008;
    pub const SIT: u32 = 1009;
    pub const RISE_SIT: u32 = 1010;
    pub const SWITCH_GAIT: u32 = 1011;
    pub const TRIGGER: u32 = 1012;
    pub const BODY_HEIGHT: u32 = 1013;
    pub const FOOT_RAISE_HEIGHT: u32 = 1014;
    pub const SPEED_LEVEL: u32 = 1015;
    pub const HELLO: u32 = 1016;
    pub const STRETCH: u32 = 1017;
    pub const TRAJECTORY_FOLLOW: u32 = 1018;
    pub const CONTINUOUS_GAIT: u32 = 1019;
    pub const CONTENT: u32 = 1020;
    pub const WALLOW: u32 = 1021;
    pub const DANCE1: u32 = 1022;
    pub const DANCE2: u32 = 1023;
    pub const GET_BODY_HEIGHT: u32 = 1024;
    pub const GET_FOOT_RAISE_HEIGHT: u32 = 1025;
    pub const GET_SPEED_LEVEL: u32 = 1026;
    pub const SWITCH_JOYSTICK: u32 = 1027;
    pub const POSE: u32 = 1028;
    pub const SCRAPE: u32 = 1029;
    pub const FRONT_FLIP: u32 = 1030;
    pub const FRONT_JUMP: u32 = 1031;
    pub const FRONT_POUNCE: u32 = 1032;
    pub const WIGGLE_HIPS: u32 = 1033;
    pub const GET_STATE: u32 = 1034;
    pub const ECONOMIC_GAIT: u32 = 1035;
    pub const FINGER_HEART: u32 = 1036;
    pub const STAND_OUT: u32 = 1039;
    pub const LEFT_FLIP: u32 = 1042;
    pub const RIGHT_FLIP: u32 = 1043;
    pub const BACK_FLIP: u32 = 1044;
    pub const LEAD_FOLLOW: u32 = 1045;
    pub const FREE_WALK: u32 = 1045;
    pub const BALANCE_AVOID: u32 = 1048;
    pub const STANDUP: u32 = 1050;
    pub const CROSS_WALK: u32 = 1051;
    pub const HANDSTAND: u32 = 1301;
    pub const CROSS_STEP: u32 = 1302;
    pub const ONESIDED_STEP: u32 = 1303;
    pub const BOUND: u32 = 1304;
    pub const MOON_WALK: u32 = 1305;
}

/// Voice/light UI command codes.
pub mod vui_cmd {
    /// Set body light brightness.
    pub const BRIGHTNESS: u32 = 1005;
    /// Set body light color.
    pub const COLOR: u32 = 1007;
}

/// Body light colors understood by the VUI service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    /// White.
    White,
    /// Red.
    Red,
    /// Yellow.
    Yellow,
    /// Blue.
    Blue,
    /// Green.
    Green,
    /// Cyan.
    Cyan,
    /// Purple.
    Purple,
}

impl std::str::FromStr for Color {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "white" => Ok(Self::White),
            "red" => Ok(Self::Red),
            "yellow" => Ok(Self::Yellow),
            "blue" => Ok(Self::Blue),
            "green" => Ok(Self::Green),
            "cyan" => Ok(Self::Cyan),
            "purple" => Ok(Self::Purple),
            other => Err(format!("unknown color: {other}")),
        }
    }
}
